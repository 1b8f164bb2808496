use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{error, info};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use core_manager::config::{Config, DEFAULT_CONFIG_PATH};
use core_manager::endpoint::codec;
use core_manager::jobs::JobStatus;
use core_manager::logging::init_logging;
use core_manager::metrics::init_metrics;
use core_manager::{CoreManager, EndpointBase, EndpointFilter, EndpointType, Error, OpContext, Result};

const JOB_POLL_INTERVAL: Duration = Duration::from_millis(200);

fn cli() -> Command {
    let filter_args = [
        Arg::new("id").long("id").value_name("ID").action(ArgAction::Append).help("Match endpoint ID"),
        Arg::new("ref").long("ref").value_name("REF").help("Match reference"),
        Arg::new("type").long("type").value_name("TYPE").help("Match type (standard, alias, default_gui)"),
        Arg::new("label").long("label").value_name("KEY=VALUE").action(ArgAction::Append).help("Match label"),
    ];
    let restricted = Arg::new("restricted")
        .long("restricted")
        .help("Reject removal of standard endpoints")
        .action(ArgAction::SetTrue);

    Command::new("core-manager")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Core Manager - gateway endpoints and core services management")
        .arg(Arg::new("test")
            .short('t')
            .long("test")
            .help("Test configuration and endpoints file and exit")
            .action(ArgAction::SetTrue))
        .arg(Arg::new("config")
            .short('c')
            .long("config")
            .value_name("FILE")
            .help("Configuration file path")
            .default_value(DEFAULT_CONFIG_PATH))
        .subcommand(Command::new("list").about("List endpoints").args(filter_args.clone()))
        .subcommand(Command::new("get").about("Show endpoint").arg(Arg::new("id").required(true)))
        .subcommand(Command::new("set")
            .about("Create or replace endpoints from a JSON file (object or array)")
            .arg(Arg::new("file").required(true)))
        .subcommand(Command::new("alias")
            .about("Add alias for a standard endpoint")
            .arg(Arg::new("id").required(true))
            .arg(Arg::new("path").required(true)))
        .subcommand(Command::new("default-gui")
            .about("Add default GUI endpoint for a standard endpoint")
            .arg(Arg::new("id").required(true)))
        .subcommand(Command::new("remove")
            .about("Remove endpoint and its dependents")
            .arg(Arg::new("id").required(true))
            .arg(restricted.clone()))
        .subcommand(Command::new("remove-all")
            .about("Remove endpoints matching filter")
            .args(filter_args)
            .arg(restricted))
        .subcommand(Command::new("services").about("List core services"))
        .subcommand(Command::new("restart")
            .about("Restart core service")
            .arg(Arg::new("service").required(true)))
        .subcommand(Command::new("logs").about("List log files"))
        .subcommand(Command::new("log")
            .about("Show last lines of a log file")
            .arg(Arg::new("id").required(true))
            .arg(Arg::new("lines")
                .short('n')
                .value_name("N")
                .value_parser(clap::value_parser!(usize))
                .default_value("100")))
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();
    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);

    // Если запрошена проверка конфигурации
    if matches.get_flag("test") {
        env_logger::init();
        return test_configuration(config_path).await;
    }

    let config = match Config::load_from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", config_path, e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("Failed to initialize logging: {}, falling back to env_logger", e);
        env_logger::init();
    }
    init_metrics();

    let manager = match CoreManager::from_config(&config).await {
        Ok(m) => m,
        Err(e) => {
            error!("Failed to initialize core manager: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(&manager, &matches).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("core-manager: [{:?}] {}", e.kind(), e.message());
            ExitCode::FAILURE
        }
    }
}

async fn run(manager: &CoreManager, matches: &ArgMatches) -> Result<ExitCode> {
    let ctx = OpContext::background();
    let Some((command, args)) = matches.subcommand() else {
        info!("No command given");
        cli().print_help().map_err(Error::internal)?;
        return Ok(ExitCode::SUCCESS);
    };

    match command {
        "list" => print_json(&manager.get_endpoints(&ctx, &parse_filter(args)?)?),
        "get" => print_json(&manager.get_endpoint(&ctx, arg(args, "id"))?),
        "set" => {
            let bases = read_bases(Path::new(arg(args, "file"))).await?;
            wait_job(manager, manager.set_endpoints(bases).await?).await
        }
        "alias" => {
            let job = manager.add_endpoint_alias(arg(args, "id"), arg(args, "path")).await?;
            wait_job(manager, job).await
        }
        "default-gui" => wait_job(manager, manager.add_default_gui_endpoint(arg(args, "id")).await?).await,
        "remove" => {
            let job = manager.remove_endpoint(arg(args, "id"), args.get_flag("restricted")).await?;
            wait_job(manager, job).await
        }
        "remove-all" => {
            let job = manager
                .remove_endpoints(parse_filter(args)?, args.get_flag("restricted"))
                .await?;
            wait_job(manager, job).await
        }
        "services" => print_json(&manager.get_core_services(&ctx).await?),
        "restart" => wait_job(manager, manager.restart_core_service(arg(args, "service")).await?).await,
        "logs" => print_json(&manager.list_logs()),
        "log" => {
            let n = args.get_one::<usize>("lines").copied().unwrap_or(100);
            let data = manager.get_log(&ctx, arg(args, "id"), n).await?;
            print!("{}", String::from_utf8_lossy(&data));
            Ok(ExitCode::SUCCESS)
        }
        other => Err(Error::invalid_input(format!("unknown command '{}'", other))),
    }
}

fn arg<'a>(args: &'a ArgMatches, name: &str) -> &'a str {
    args.get_one::<String>(name).map(String::as_str).unwrap_or_default()
}

fn print_json<T: Serialize>(value: &T) -> Result<ExitCode> {
    let out = serde_json::to_string_pretty(value).map_err(Error::internal)?;
    println!("{}", out);
    Ok(ExitCode::SUCCESS)
}

fn parse_filter(args: &ArgMatches) -> Result<EndpointFilter> {
    let mut filter = EndpointFilter {
        ids: args.get_many::<String>("id").map(|v| v.cloned().collect()).unwrap_or_default(),
        reference: args.get_one::<String>("ref").cloned(),
        ..Default::default()
    };
    if let Some(t) = args.get_one::<String>("type") {
        filter.endpoint_type = Some(
            t.parse::<EndpointType>()
                .map_err(|_| Error::invalid_input(format!("unknown endpoint type '{}'", t)))?,
        );
    }
    let mut labels = BTreeMap::new();
    for label in args.get_many::<String>("label").into_iter().flatten() {
        let (k, v) = label
            .split_once('=')
            .ok_or_else(|| Error::invalid_input(format!("label '{}' must be KEY=VALUE", label)))?;
        labels.insert(k.to_string(), v.to_string());
    }
    filter.labels = labels;
    Ok(filter)
}

async fn read_bases(path: &Path) -> Result<Vec<EndpointBase>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::invalid_input(format!("reading {} failed: {}", path.display(), e)))?;
    let value: serde_json::Value =
        serde_json::from_str(&content).map_err(|e| Error::invalid_input(e.to_string()))?;
    let bases = if value.is_array() {
        serde_json::from_value(value)
    } else {
        serde_json::from_value(value).map(|b| vec![b])
    };
    bases.map_err(|e| Error::invalid_input(e.to_string()))
}

/// Ждет задачу и печатает ее итог
async fn wait_job(manager: &CoreManager, id: String) -> Result<ExitCode> {
    info!("Job {} created", id);
    let job = manager.jobs().wait(&id, JOB_POLL_INTERVAL).await?;
    print_json(&job)?;
    Ok(match job.status() {
        JobStatus::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

/// Проверка конфигурации (как nginx -t)
async fn test_configuration(config_path: &str) -> ExitCode {
    println!("core-manager: testing configuration file {}...", config_path);

    let config = match Config::load_from_file(config_path) {
        Ok(config) => {
            println!("core-manager: configuration file {} syntax is ok", config_path);
            config
        }
        Err(e) => {
            println!("core-manager: [error] configuration file {} test failed: {}", config_path, e);
            return ExitCode::FAILURE;
        }
    };

    let mut warnings = 0;
    let conf_path = Path::new(&config.endpoints_conf_path);
    if !conf_path.exists() {
        println!("core-manager: [warn] endpoints file {} not found", conf_path.display());
        warnings += 1;
    } else {
        let loaded = match tokio::fs::read_to_string(conf_path).await {
            Ok(content) => core_manager::config::NginxConfig::parse_config_content(&content)
                .map_err(codec::CodecError::from)
                .and_then(|tree| codec::load_endpoints(&tree, &config.templates)),
            Err(e) => Err(e.into()),
        };
        match loaded {
            Ok(endpoints) => {
                let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
                for e in endpoints.values() {
                    *by_type.entry(e.endpoint_type.as_str()).or_default() += 1;
                    println!("core-manager: {} [{}] {} -> {}", e.id, e.endpoint_type, e.location, e.base.host);
                }
                println!("core-manager: {} endpoint(s) decoded {:?}", endpoints.len(), by_type);
            }
            Err(e) => {
                println!("core-manager: [error] endpoints file {} test failed: {}", conf_path.display(), e);
                return ExitCode::FAILURE;
            }
        }
    }

    if !Path::new(&config.compose_file_path).exists() {
        println!("core-manager: [warn] compose file {} not found", config.compose_file_path);
        warnings += 1;
    }

    if warnings > 0 {
        println!("core-manager: configuration test is successful (with {} warning(s))", warnings);
    } else {
        println!("core-manager: configuration test is successful");
    }
    ExitCode::SUCCESS
}
