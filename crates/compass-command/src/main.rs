use std::sync::Arc;

use clap::{Parser, Subcommand};
use compass_client::{
    HttpTransport, InstanceDescriptor, RegistryClient, RegistryConfig, RegistryEvent,
    RegistryTransport, ServiceDescriptor,
};
use compass_core::InstanceStatus;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "compass")]
#[command(about = "Compass service registry CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Comma-separated registry addresses
    #[arg(long, env = "COMPASS_REGISTRY", default_value = "http://127.0.0.1:30100", value_delimiter = ',')]
    registry: Vec<String>,

    /// Bearer token sent with every request
    #[arg(long, env = "COMPASS_TOKEN")]
    token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Service management
    Service {
        #[command(subcommand)]
        sub: ServiceCommands,
    },
    /// Instance management
    Instance {
        #[command(subcommand)]
        sub: InstanceCommands,
    },
    /// Resolve instances of a service by version rule (e.g. 1.0.0+, 1.0.0-2.0.0, latest)
    Resolve {
        #[arg(long)]
        app: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "latest")]
        rule: String,
    },
    /// Show instances grouped by compatible version
    Groups {
        #[arg(long)]
        app: String,
        #[arg(long)]
        name: String,
    },
    /// Register an instance and keep it alive until Ctrl-C
    Run {
        #[arg(long)]
        app: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        version: String,
        #[arg(long)]
        host: String,
        /// Endpoint URI such as rest://10.0.0.4:8080 (repeatable)
        #[arg(long = "endpoint", required = true)]
        endpoints: Vec<String>,
        /// Dependency to watch, as app/name (repeatable)
        #[arg(long = "watch")]
        watches: Vec<String>,
        #[arg(long, env = "COMPASS_HEARTBEAT_INTERVAL_MS", default_value_t = 30_000)]
        heartbeat_interval_ms: u64,
    },
    /// Request a bearer token for an identity known to the registry
    Token {
        #[arg(long)]
        common_name: String,
    },
}

#[derive(Subcommand)]
enum ServiceCommands {
    /// Register a service (returns the existing id if already registered)
    Register {
        #[arg(long)]
        app: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        version: String,
        #[arg(long)]
        alias: Option<String>,
    },
    /// Show one service as JSON
    Get { service_id: String },
    /// List all registered services
    List,
}

#[derive(Subcommand)]
enum InstanceCommands {
    /// List instances of a service
    List {
        #[arg(long)]
        service: String,
    },
    /// Remove an instance
    Unregister {
        #[arg(long)]
        service: String,
        #[arg(long)]
        instance: String,
    },
    /// Change the status of an instance (UP, DOWN, STARTING, TESTING, OUTOFSERVICE)
    Status {
        #[arg(long)]
        service: String,
        #[arg(long)]
        instance: String,
        #[arg(long)]
        value: InstanceStatus,
    },
}

fn print_instances(instances: &[InstanceDescriptor]) {
    println!("{:<38} {:<38} {:<20} {:<12} {:<30}", "Instance", "Service", "Host", "Status", "Endpoints");
    println!("{}", "-".repeat(140));
    for inst in instances {
        println!(
            "{:<38} {:<38} {:<20} {:<12} {:<30}",
            inst.instance_id,
            inst.service_id,
            inst.host_name,
            inst.status.as_str(),
            inst.endpoints.join(",")
        );
    }
}

fn split_dependency(text: &str) -> Result<(String, String), Box<dyn std::error::Error>> {
    match text.split_once('/') {
        Some((app, name)) if !app.is_empty() && !name.is_empty() => Ok((app.to_string(), name.to_string())),
        _ => Err(format!("invalid dependency {text:?}, expected app/name").into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = RegistryConfig::from_env()?.with_addresses(cli.registry);
    if cli.token.is_some() {
        config.auth_token = cli.token;
    }

    match cli.command {
        Commands::Service { sub } => {
            let transport = HttpTransport::new(&config)?;
            match sub {
                ServiceCommands::Register { app, name, version, alias } => {
                    let mut service = ServiceDescriptor::new(app, name, version);
                    if let Some(alias) = alias {
                        service = service.with_alias(alias);
                    }
                    let service_id = transport.register_service(&service).await?;
                    println!("Service registered: {}", service_id);
                }
                ServiceCommands::Get { service_id } => {
                    let service = transport.get_service(&service_id).await?;
                    println!("{}", serde_json::to_string_pretty(&service)?);
                }
                ServiceCommands::List => {
                    let services = transport.list_services().await?;
                    println!("Registered Services:");
                    println!("{:<38} {:<15} {:<20} {:<10}", "ID", "App", "Name", "Version");
                    println!("{}", "-".repeat(85));
                    for svc in services {
                        println!("{:<38} {:<15} {:<20} {:<10}", svc.service_id, svc.app_id, svc.service_name, svc.version);
                    }
                }
            }
        }
        Commands::Instance { sub } => {
            let transport = HttpTransport::new(&config)?;
            match sub {
                InstanceCommands::List { service } => {
                    let instances = transport.list_instances(&service).await?;
                    println!("Service Instances:");
                    print_instances(&instances);
                }
                InstanceCommands::Unregister { service, instance } => {
                    transport.unregister_instance(&service, &instance).await?;
                    println!("Instance unregistered: {}", instance);
                }
                InstanceCommands::Status { service, instance, value } => {
                    transport.update_instance_status(&service, &instance, value).await?;
                    println!("Instance {} is now {}", instance, value.as_str());
                }
            }
        }
        Commands::Resolve { app, name, rule } => {
            let client = RegistryClient::consumer(config)?;
            let instances = client.resolve(&app, &name, &rule).await?;
            println!("Instances of {}/{} matching {}:", app, name, rule);
            print_instances(&instances);
        }
        Commands::Groups { app, name } => {
            let client = RegistryClient::consumer(config)?;
            let groups = client.group_by_compatible_version(&app, &name).await?;
            for (rule, instances) in groups {
                println!("{} ({} instances)", rule, instances.len());
                for inst in instances {
                    println!("  {:<38} {:<20} {}", inst.instance_id, inst.host_name, inst.endpoints.join(","));
                }
            }
        }
        Commands::Run { app, name, version, host, endpoints, watches, heartbeat_interval_ms } => {
            config.heartbeat_interval_ms = heartbeat_interval_ms;
            let dependencies = watches
                .iter()
                .map(|w| split_dependency(w))
                .collect::<Result<Vec<_>, _>>()?;

            let client = Arc::new(RegistryClient::new(
                config,
                ServiceDescriptor::new(app, name, version),
                InstanceDescriptor::new(host, endpoints),
            )?);
            let mut events = client.subscribe();
            client.start();

            for (app, name) in &dependencies {
                match client.resolve(app, name, "0+").await {
                    Ok(instances) => println!("{}/{}: {} instances", app, name, instances.len()),
                    Err(e) => eprintln!("{}/{}: {}", app, name, e),
                }
            }

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(RegistryEvent::RegistrationStateChanged { to, .. }) => {
                            println!("registration: {}", to);
                        }
                        Ok(RegistryEvent::InstancesChanged(change)) => {
                            println!(
                                "{}/{} revision {}: +{} ~{} -{}",
                                change.app_id,
                                change.service_name,
                                change.revision,
                                change.diff.added.len(),
                                change.diff.updated.len(),
                                change.diff.deleted.len()
                            );
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }

            client.shutdown().await?;
            println!("Stopped");
        }
        Commands::Token { common_name } => {
            let transport = HttpTransport::new(&config)?;
            let token = transport.issue_token(&common_name).await?;
            println!("{}", token);
        }
    }

    Ok(())
}
