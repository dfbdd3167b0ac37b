use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Result;
use clap::{error::ErrorKind, CommandFactory, Parser, ValueEnum};
use data_model::{EsxHost, LunBuilder, PersistentVolumeBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use xcopy_populator::{
    config::{CloneMethod, PopulatorConfig},
    executor::{InBandExecutor, OutOfBandExecutor, TaskExecutor},
    hypervisor::{HypervisorClient, SshEsxCli},
    lease::{FileLeaseStore, HostLeaseLocker, LeaseSettings, LeaseStore, MemoryLeaseStore},
    storage::{Capabilities, InMemoryArray, StorageAdapter},
    tracing::setup_tracing,
    PopulateRequest,
    PopulatorDeps,
    Service,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StorageVendor {
    /// Process-local reference array.
    InMemory,
}

#[derive(Debug, Parser)]
#[command(name = "xcopy-populator")]
#[command(about = "Populates a persistent volume from a VM disk using storage offload", long_about = None)]
struct Cli {
    #[arg(long, help = "id of the VM owning the source disk")]
    source_vm_id: String,

    #[arg(long, help = "source disk, as `[datastore] dir/file.vmdk`")]
    source_vmdk: String,

    #[arg(long, help = "name of the target persistent volume")]
    target_pv_name: String,

    #[arg(long, help = "CSI volume handle of the target persistent volume")]
    target_pv_handle: String,

    #[arg(long, value_enum, help = "storage array vendor")]
    storage_vendor: StorageVendor,

    #[arg(long, env = "STORAGE_TOKEN", hide_env_values = true)]
    storage_token: Option<String>,

    #[arg(long, env = "STORAGE_USERNAME")]
    storage_username: Option<String>,

    #[arg(long, env = "STORAGE_PASSWORD", hide_env_values = true)]
    storage_password: Option<String>,

    #[arg(long, help = "hypervisor host id to run the clone on")]
    esxi_host: Option<String>,

    #[arg(long, help = "address to reach the hypervisor host on, defaults to its id")]
    esxi_address: Option<String>,

    #[arg(long, help = "NAA id of the target volume, seeds the in-memory array")]
    target_lun_naa: Option<String>,

    #[arg(long, short = 'c', help = "path to the populator config file")]
    config: Option<PathBuf>,
}

impl Cli {
    fn validate_credentials(&self) {
        let has_token = self.storage_token.as_deref().is_some_and(|t| !t.is_empty());
        let has_password = self.storage_username.as_deref().is_some_and(|u| !u.is_empty())
            && self.storage_password.as_deref().is_some_and(|p| !p.is_empty());
        if !has_token && !has_password {
            Cli::command()
                .error(
                    ErrorKind::MissingRequiredArgument,
                    "storage credentials required: --storage-token or --storage-username with --storage-password",
                )
                .exit();
        }
    }

    fn request(&self) -> Result<PopulateRequest> {
        let target_pv = PersistentVolumeBuilder::default()
            .name(self.target_pv_name.clone())
            .volume_handle(self.target_pv_handle.clone())
            .build()?;
        Ok(PopulateRequest {
            vm_id: self.source_vm_id.clone(),
            source_vmdk: self.source_vmdk.clone(),
            target_pv,
            host_id: self.esxi_host.clone(),
        })
    }
}

async fn storage_adapter(cli: &Cli) -> Result<Arc<dyn StorageAdapter>> {
    match cli.storage_vendor {
        StorageVendor::InMemory => {
            let array = InMemoryArray::new().with_capabilities(Capabilities {
                volume_tagging: true,
                ..Default::default()
            });
            let mut lun = LunBuilder::default();
            lun.name(cli.target_pv_name.clone())
                .ldev_id(cli.target_pv_handle.clone())
                .volume_handle(cli.target_pv_handle.clone());
            if let Some(naa) = &cli.target_lun_naa {
                lun.naa(naa.clone());
            }
            array.add_volume(lun.build()?).await;
            Ok(Arc::new(array))
        }
    }
}

async fn lease_store(config: &PopulatorConfig) -> Result<Arc<dyn LeaseStore>> {
    match &config.host_lease.store_dir {
        Some(dir) => Ok(Arc::new(
            FileLeaseStore::new(dir, &config.host_lease.namespace).await?,
        )),
        None => {
            warn!("No lease store directory configured, host leases are process-local");
            Ok(Arc::new(MemoryLeaseStore::new()))
        }
    }
}

async fn build_service(cli: &Cli, config: &PopulatorConfig) -> Result<Service> {
    let host_id = cli.esxi_host.clone().unwrap_or_default();
    let host = EsxHost {
        id: host_id.clone(),
        name: host_id,
        address: cli.esxi_address.clone(),
    };
    let ssh = Arc::new(SshEsxCli::new(config.ssh.clone(), host));
    let hypervisor: Arc<dyn HypervisorClient> = ssh.clone();
    let executor: Arc<dyn TaskExecutor> = match config.clone_method {
        CloneMethod::Vib => Arc::new(InBandExecutor::new(hypervisor.clone())),
        CloneMethod::Ssh => Arc::new(OutOfBandExecutor::new(ssh)),
    };

    let locker = HostLeaseLocker::new(
        lease_store(config).await?,
        LeaseSettings::from(&config.host_lease),
    );
    info!(holder = %locker.holder(), clone_method = %config.clone_method, "Populator configured");

    let deps = PopulatorDeps::new(
        config,
        storage_adapter(cli).await?,
        hypervisor,
        executor,
        locker,
    );
    Ok(Service::new(deps))
}

async fn run(cli: Cli, config: PopulatorConfig) -> Result<()> {
    let service = build_service(&cli, &config).await?;
    let request = cli.request()?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling population");
            on_signal.cancel();
        }
    });

    service.run(request, cancel).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    cli.validate_credentials();

    let config = match PopulatorConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config: {e:?}");
            return ExitCode::FAILURE;
        }
    };
    setup_tracing(&config);

    match run(cli, config).await {
        Ok(()) => {
            info!("Population finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Population failed");
            ExitCode::FAILURE
        }
    }
}
