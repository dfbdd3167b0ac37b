//! Host initiator identifiers and WWN helpers.

use std::{fmt, str::FromStr};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

const FC_PREFIX: &str = "fc.";
const ISCSI_PREFIX: &str = "iqn.";
const NVME_PREFIX: &str = "nqn.";

/// A host-side storage transport endpoint, tagged by its prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InitiatorId {
    /// `fc.<WWNN>:<WWPN>`, both stored upper-cased without separators.
    Fc { wwnn: String, wwpn: String },
    Iscsi(String),
    Nvme(String),
}

impl InitiatorId {
    pub fn is_fc(&self) -> bool {
        matches!(self, InitiatorId::Fc { .. })
    }

    /// Colon-formatted WWPN for FC initiators.
    pub fn wwpn_display(&self) -> Option<String> {
        match self {
            InitiatorId::Fc { wwpn, .. } => Some(format_wwn_with_colons(wwpn)),
            _ => None,
        }
    }
}

impl FromStr for InitiatorId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let lowered = trimmed.to_lowercase();
        if lowered.starts_with(FC_PREFIX) {
            let (wwnn, wwpn) = parse_fc_adapter(trimmed)?;
            Ok(InitiatorId::Fc { wwnn, wwpn })
        } else if lowered.starts_with(ISCSI_PREFIX) {
            Ok(InitiatorId::Iscsi(trimmed.to_string()))
        } else if lowered.starts_with(NVME_PREFIX) {
            Ok(InitiatorId::Nvme(trimmed.to_string()))
        } else {
            Err(anyhow!("unrecognised initiator identifier {trimmed:?}"))
        }
    }
}

impl fmt::Display for InitiatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitiatorId::Fc { wwnn, wwpn } => write!(f, "{FC_PREFIX}{wwnn}:{wwpn}"),
            InitiatorId::Iscsi(id) | InitiatorId::Nvme(id) => f.write_str(id),
        }
    }
}

/// Splits `fc.WWNN:WWPN` into upper-cased WWNN and WWPN.
pub fn parse_fc_adapter(fc_id: &str) -> Result<(String, String)> {
    let body = fc_id
        .get(..FC_PREFIX.len())
        .filter(|prefix| prefix.eq_ignore_ascii_case(FC_PREFIX))
        .map(|_| &fc_id[FC_PREFIX.len()..])
        .ok_or_else(|| anyhow!("FC adapter id {fc_id:?} doesn't start with 'fc.'"))?;

    let parts: Vec<&str> = body.split(':').collect();
    let [wwnn, wwpn] = parts.as_slice() else {
        return Err(anyhow!(
            "FC adapter id {fc_id:?} is not in expected fc.WWNN:WWPN format"
        ));
    };
    if wwnn.is_empty() || wwpn.is_empty() {
        return Err(anyhow!("FC adapter id {fc_id:?} has empty WWNN or WWPN"));
    }

    for (label, value) in [("WWNN", wwnn), ("WWPN", wwpn)] {
        if value.len() % 2 != 0 {
            return Err(anyhow!(
                "{label} {value:?} in {fc_id:?} has odd length {}",
                value.len()
            ));
        }
        if !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(anyhow!("{label} {value:?} in {fc_id:?} contains non-hex characters"));
        }
    }

    Ok((wwnn.to_uppercase(), wwpn.to_uppercase()))
}

/// Pairs of characters joined by `:`. A trailing odd character stays alone.
pub fn format_wwn_with_colons(wwn: &str) -> String {
    let chars: Vec<char> = wwn.chars().collect();
    chars
        .chunks(2)
        .map(|pair| pair.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(":")
}

pub fn normalize_wwn(wwn: &str) -> String {
    wwn.chars()
        .filter(|c| !matches!(c, ':' | '-' | ' '))
        .collect::<String>()
        .to_uppercase()
}

pub fn extract_wwpn(fc_id: &str) -> Result<String> {
    let (_, wwpn) = parse_fc_adapter(fc_id)?;
    Ok(wwpn)
}

pub fn extract_and_format_wwpn(fc_id: &str) -> Result<String> {
    Ok(format_wwn_with_colons(&extract_wwpn(fc_id)?))
}

pub fn compare_wwns(a: &str, b: &str) -> bool {
    normalize_wwn(a) == normalize_wwn(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fc_adapter_valid() {
        let (wwnn, wwpn) = parse_fc_adapter("fc.20000000c0a80abc:2a000000C0A80DEF").unwrap();
        assert_eq!(wwnn, "20000000C0A80ABC");
        assert_eq!(wwpn, "2A000000C0A80DEF");
    }

    #[test]
    fn test_parse_fc_adapter_errors() {
        let cases = [
            ("20000000C0A80ABC:21000000C0A80DEF", "doesn't start with 'fc.'"),
            ("iqn.20000000C0A80ABC:21000000C0A80DEF", "doesn't start with 'fc.'"),
            ("", "doesn't start with 'fc.'"),
            ("fc.20000000C0A80ABC", "not in expected fc.WWNN:WWPN format"),
            ("fc.2000:0000:C0A8", "not in expected fc.WWNN:WWPN format"),
            ("fc.20000000C0A80ABC:", "empty WWNN or WWPN"),
            ("fc.:21000000C0A80DEF", "empty WWNN or WWPN"),
            ("fc.2000000C0A80ABC:21000000C0A80DEF", "WWNN"),
            ("fc.20000000C0A80ABC:2100000C0A80DEF", "WWPN"),
            ("fc.2000000GC0A80ABC:21000000C0A80DEF", "non-hex"),
            ("fc.20000000C0A80ABC:2100000ZC0A80DEF", "non-hex"),
        ];
        for (input, fragment) in cases {
            let err = parse_fc_adapter(input).unwrap_err().to_string();
            assert!(
                err.contains(fragment),
                "{input:?}: expected {fragment:?} in {err:?}"
            );
        }
    }

    #[test]
    fn test_format_wwn_with_colons() {
        assert_eq!(
            format_wwn_with_colons("21000000C0A80DEF"),
            "21:00:00:00:C0:A8:0D:EF"
        );
        assert_eq!(format_wwn_with_colons("123456789"), "12:34:56:78:9");
        assert_eq!(format_wwn_with_colons("AB"), "AB");
        assert_eq!(format_wwn_with_colons("A"), "A");
        assert_eq!(format_wwn_with_colons(""), "");
    }

    #[test]
    fn test_normalize_wwn() {
        assert_eq!(normalize_wwn("21:00-00 00:C0-A8 0D:EF"), "21000000C0A80DEF");
        assert_eq!(normalize_wwn("abcdef0123456789"), "ABCDEF0123456789");
        assert_eq!(normalize_wwn(""), "");
        let once = normalize_wwn("ab:cd-ef");
        assert_eq!(normalize_wwn(&once), once);
    }

    #[test]
    fn test_extract_wwpn() {
        assert_eq!(
            extract_wwpn("fc.20000000c0a80abc:abcdef0123456789").unwrap(),
            "ABCDEF0123456789"
        );
        assert_eq!(
            extract_and_format_wwpn("fc.20000000C0A80ABC:21000000C0A80DEF").unwrap(),
            "21:00:00:00:C0:A8:0D:EF"
        );
        assert!(extract_and_format_wwpn("fc.20000000C0A80ABC:210000000000001")
            .unwrap_err()
            .to_string()
            .contains("odd length"));
        assert!(extract_wwpn("20000000C0A80ABC:21000000C0A80DEF")
            .unwrap_err()
            .to_string()
            .contains("doesn't start with 'fc.'"));
    }

    #[test]
    fn test_compare_wwns() {
        assert!(compare_wwns("21:00:00:00:C0:A8:0D:EF", "21000000C0A80DEF"));
        assert!(compare_wwns("21:00:00:00:C0:A8:0D:EF", "21-00-00-00-C0-A8-0D-EF"));
        assert!(compare_wwns("abcdef0123456789", "AB:CD:EF:01:23:45:67:89"));
        assert!(!compare_wwns("21:00:00:00:C0:A8:0D:EF", "21:00:00:00:C0:A8:0D:FF"));
        assert!(compare_wwns("", ""));
        assert!(!compare_wwns("21000000C0A80DEF", ""));
    }

    #[test]
    fn test_initiator_round_trip() {
        let id: InitiatorId = "fc.20000000c0a80abc:21000000c0a80def".parse().unwrap();
        assert!(id.is_fc());
        assert_eq!(id.to_string(), "fc.20000000C0A80ABC:21000000C0A80DEF");
        let again: InitiatorId = id.to_string().parse().unwrap();
        assert_eq!(again, id);
        assert_eq!(
            id.wwpn_display().unwrap(),
            "21:00:00:00:C0:A8:0D:EF"
        );

        let iqn: InitiatorId = "iqn.1998-01.com.vmware:esx-1".parse().unwrap();
        assert_eq!(iqn, InitiatorId::Iscsi("iqn.1998-01.com.vmware:esx-1".into()));
        let nqn: InitiatorId = "nqn.2014-08.org.nvmexpress:uuid:1234".parse().unwrap();
        assert!(matches!(nqn, InitiatorId::Nvme(_)));
        assert!("eui.1234".parse::<InitiatorId>().is_err());
    }

    #[test]
    fn test_upper_case_fc_prefix() {
        let id: InitiatorId = "FC.20000000c0a80abc:21000000c0a80def".parse().unwrap();
        assert_eq!(
            id,
            InitiatorId::Fc {
                wwnn: "20000000C0A80ABC".into(),
                wwpn: "21000000C0A80DEF".into(),
            }
        );
        assert_eq!(extract_wwpn("Fc.2000:2100").unwrap(), "2100");
        assert!(parse_fc_adapter("FC.2000:21G0")
            .unwrap_err()
            .to_string()
            .contains("non-hex"));
    }
}
