use std::sync::Arc;

use tokio::runtime::{self, Runtime};

use crate::{
    cli::{LogFormat, Opts, SubCommand, UpOpts, ValidateOpts, handle_config_errors},
    cluster::{ClusterHandle, KubeCluster},
    config::Config,
    lifecycle::{ManagedResource, ResourceLifecycleController},
    namespace::TestNamespace,
    trace,
};

pub struct Application {
    opts: Opts,
    runtime: Runtime,
}

impl Application {
    pub fn prepare() -> Result<Self, exitcode::ExitCode> {
        let opts = Opts::get_matches().map_err(|error| {
            _ = error.print();
            if error.use_stderr() {
                exitcode::USAGE
            } else {
                exitcode::OK
            }
        })?;
        Self::prepare_from_opts(opts)
    }

    pub fn prepare_from_opts(opts: Opts) -> Result<Self, exitcode::ExitCode> {
        let level = std::env::var("TESTPODS_LOG")
            .unwrap_or_else(|_| trace::directives(opts.log_level()));
        let json = opts.root.log_format == LogFormat::Json;
        trace::init(opts.root.color.use_color(), json, &level);
        debug!(message = "Log level is enabled.", level = ?level);

        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("testpods-worker")
            .build()
            .map_err(|error| {
                error!(message = "Unable to create async runtime.", %error);
                exitcode::OSERR
            })?;

        Ok(Self { opts, runtime })
    }

    pub fn run(self) -> exitcode::ExitCode {
        let Self { opts, runtime } = self;
        match opts.sub_command {
            SubCommand::Validate(validate_opts) => validate(&validate_opts),
            SubCommand::Up(up_opts) => runtime.block_on(up(&up_opts)),
        }
    }
}

fn validate(opts: &ValidateOpts) -> exitcode::ExitCode {
    match Config::load(&opts.config) {
        Ok(config) => {
            info!(
                message = "Config is valid.",
                path = ?opts.config,
                resources = config.resources.len(),
            );
            exitcode::OK
        }
        Err(error) => handle_config_errors(&error),
    }
}

async fn up(opts: &UpOpts) -> exitcode::ExitCode {
    let config = match Config::load(&opts.config) {
        Ok(config) => config,
        Err(error) => return handle_config_errors(&error),
    };
    let selected = match config.select(&opts.resources) {
        Ok(selected) => selected,
        Err(error) => return handle_config_errors(&error),
    };

    let cluster: Arc<dyn ClusterHandle> = match KubeCluster::try_default(config.access.build()).await {
        Ok(cluster) => Arc::new(cluster),
        Err(error) => {
            error!(message = "Unable to connect to the cluster.", %error);
            return exitcode::UNAVAILABLE;
        }
    };

    let mut namespace = TestNamespace::new(Arc::clone(&cluster), config.namespace.resolve_name());
    if let Err(error) = namespace.create().await {
        error!(message = "Unable to create namespace.", namespace = %namespace.name(), %error);
        return exitcode::UNAVAILABLE;
    }

    let controller = ResourceLifecycleController::new(Arc::clone(&cluster))
        .with_settings(config.lifecycle.settings());

    let mut started: Vec<ManagedResource> = Vec::with_capacity(selected.len());
    let mut code = exitcode::OK;
    for resource_config in selected {
        let mut resource = match resource_config.build(namespace.name()) {
            Ok(resource) => resource,
            Err(error) => {
                code = handle_config_errors(&error);
                break;
            }
        };
        if let Err(error) = controller.start(&mut resource).await {
            error!(message = "Unable to start resource.", %error);
            code = exitcode::SOFTWARE;
            break;
        }
        if let Ok(endpoint) = resource.endpoint() {
            println!("{} {}", resource.id().name, endpoint);
        }
        started.push(resource);
    }

    if code == exitcode::OK {
        info!(
            message = "All resources are ready; press Ctrl-C to stop.",
            count = started.len(),
        );
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(message = "Unable to listen for Ctrl-C; shutting down.", %error);
        }
        info!(message = "Shutting down.");
    }

    for resource in started.iter_mut().rev() {
        controller.stop(resource).await;
    }

    if config.namespace.delete_on_exit {
        if let Err(error) = namespace.close().await {
            warn!(message = "Unable to delete namespace.", namespace = %namespace.name(), %error);
        }
    } else {
        info!(message = "Keeping namespace.", namespace = %namespace.name());
    }

    code
}
