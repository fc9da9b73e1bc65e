//
// Copyright 2020 Joyent, Inc.
//

//
// Asks a breakshot instance for its status over the control protocol and
// prints the instance id and the nodes it hosts. With -n, invokes that node
// with the payload given by -p and prints the reply instead.
//
// The -l argument is useful for controlling the amount of log spam. Set it to
// "critical" to see only the output.
//

use std::env;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use breakshot::connection_pool::types::AsyncConnectionPoolOptions;
use breakshot::connection_pool::AsyncConnectionPool;
use breakshot::control_client::{ControlClient, ControlClientOptions};
use breakshot::id::NodeId;
use breakshot::invoker::RemoteInvoker;
use breakshot::thread_context::types::ThreadContextPoolOptions;
use breakshot::thread_context::ThreadContextPool;
use breakshot::transport::{resolve_address, tcp_socket_factory};
use clap::{crate_name, crate_version, App, Arg};
use slog::{o, Drain, Level, LevelFilter, Logger};

const DEFAULT_ADDRESS: &str = "127.0.0.1:7400";
const DEFAULT_TIMEOUT: u64 = 5000;
const DEFAULT_LOG_LEVEL: Level = Level::Info;
const LOG_LEVEL_ENV_VAR: &str = "BREAKSHOT_LOG_LEVEL";

fn main() {
    let matches = App::new("Breakshot Status")
        .version(crate_version!())
        .about("Queries a breakshot instance over the control protocol")
        .arg(
            Arg::with_name("address")
                .short("a")
                .long("address")
                .takes_value(true)
                .help(
                    format!(
                        "Control address of the instance, host:port\n\
                         (default: {})",
                        DEFAULT_ADDRESS
                    )
                    .as_str(),
                ),
        )
        .arg(
            Arg::with_name("timeout")
                .short("t")
                .long("timeout")
                .takes_value(true)
                .help(
                    format!(
                        "Request timeout in milliseconds\n(default: {})",
                        DEFAULT_TIMEOUT
                    )
                    .as_str(),
                ),
        )
        .arg(
            Arg::with_name("node")
                .short("n")
                .long("node")
                .takes_value(true)
                .help("Encoded id of a node to invoke instead of reading status"),
        )
        .arg(
            Arg::with_name("payload")
                .short("p")
                .long("payload")
                .takes_value(true)
                .requires("node")
                .help("Payload sent to the node (default: empty)"),
        )
        .arg(
            Arg::with_name("log level")
                .short("l")
                .long("log-level")
                .takes_value(true)
                .help(
                    format!(
                        "Log level: trace|debug|info|warning|error|critical\n\
                         (uses {} env var if flag not given)\n\
                         (default: {})",
                        LOG_LEVEL_ENV_VAR,
                        format!("{:?}", DEFAULT_LOG_LEVEL).to_lowercase()
                    )
                    .as_str(),
                ),
        )
        .get_matches();

    let address = matches
        .value_of("address")
        .unwrap_or(DEFAULT_ADDRESS)
        .to_string();
    let timeout = match matches.value_of("timeout") {
        Some(t) => match t.parse::<u64>() {
            Ok(t) => t,
            Err(_) => exit_with(format!("invalid timeout: {}", t)),
        },
        None => DEFAULT_TIMEOUT,
    };
    let node = match matches.value_of("node") {
        Some(n) => match NodeId::from_str(n) {
            Ok(node) => Some(node),
            Err(e) => exit_with(format!("invalid node id: {}", e)),
        },
        None => None,
    };
    let payload = matches.value_of("payload").unwrap_or("").to_string();

    //
    // Try to get the log level from the CLI arg and, if that fails, the
    // environment variable. If both fail, just use the default.
    //
    let level = match matches.value_of("log level") {
        Some(level_str) => parse_log_level(level_str),
        None => match env::var(LOG_LEVEL_ENV_VAR) {
            Ok(level_str) => parse_log_level(&level_str),
            Err(_) => Ok(DEFAULT_LOG_LEVEL),
        },
    };
    let level = level.unwrap_or_else(|e| exit_with(e));

    std::process::exit(match run(address, timeout, node, payload, level) {
        Ok(_) => 0,
        Err(err) => {
            eprintln!("error: {}", err);
            1
        }
    });
}

fn exit_with(message: String) -> ! {
    eprintln!("error: {}", message);
    std::process::exit(2)
}

fn parse_log_level(s: &str) -> Result<Level, String> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(Level::Trace),
        "debug" => Ok(Level::Debug),
        "info" => Ok(Level::Info),
        "warning" => Ok(Level::Warning),
        "error" => Ok(Level::Error),
        "critical" => Ok(Level::Critical),
        other => Err(format!("invalid log level: {}", other)),
    }
}

fn standard_log(level: Level) -> Logger {
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_bunyan::with_name(crate_name!(), std::io::stderr()).build(),
            level,
        ))
        .fuse(),
        o!("build-id" => crate_version!()),
    )
}

fn run(
    address: String,
    timeout: u64,
    node: Option<NodeId>,
    payload: String,
    level: Level,
) -> Result<(), String> {
    let log = standard_log(level);
    let addr = resolve_address(&address).map_err(|e| e.to_string())?;

    let contexts = ThreadContextPool::start(ThreadContextPoolOptions {
        io_threads: Some(1),
        name: Some(String::from("status")),
        log: Some(log.clone()),
    })
    .map_err(|e| e.to_string())?;

    let pool = AsyncConnectionPool::new(
        AsyncConnectionPoolOptions {
            min_connections: Some(0),
            max_connections: Some(1),
            acquire_timeout: Some(timeout),
            name: Some(address.clone()),
            log: Some(log.clone()),
        },
        &contexts,
        tcp_socket_factory(addr),
    )
    .map_err(|e| e.to_string())?;
    let client = ControlClient::new(
        pool.clone(),
        ControlClientOptions {
            request_timeout: Some(timeout),
            origin: None,
            log: Some(log.clone()),
        },
    );

    let result = match node {
        Some(node) => {
            let invoker = RemoteInvoker::new(client, Some(log));
            let reply = invoker.invoke(&node, payload.as_bytes(), None);
            let _ = invoker.close();
            reply.map(|bytes| {
                println!("{}", String::from_utf8_lossy(&bytes));
            })
        }
        None => {
            let status = client.get_instance_status(None);
            let _ = pool.close();
            status.map(|status| {
                println!("instance {}", status.instance_id);
                for node in &status.nodes {
                    println!("  node {}", node);
                }
            })
        }
    };

    let _ = contexts.stop();
    result.map_err(|e| e.to_string())
}
