use func_dispatch::{connect_bus, CallRequest, DispatchClient, FunctionGateway};
use func_lib::{FnError, FnResult, NodeKind, PlatformConfig, DEFAULT_PLATFORM_CONFIG_PATH};
use func_meta::{
    DbRunRecordSink, MetaDb, NamespaceTree, NodeSpec, PathResolver, RunRecorder, RunnerRegistry,
    SearchQuery, VersionLedger,
};
use log::error;
use serde::Serialize;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

fn usage() -> String {
    format!(
        "usage: func_ctl [--config <path>] <command> [args...]\n\
         commands:\n\
         \x20 init-runner <owner> <name> <title>\n\
         \x20 mkdir <owner> <parent_id> <name>\n\
         \x20 rename <owner> <node_id> <name>\n\
         \x20 mv <owner> <node_id> <parent_id>\n\
         \x20 fork <node_id> <target_parent_id> <new_owner> [name]\n\
         \x20 rm <owner> <node_id>\n\
         \x20 tree <owner> <root_id>\n\
         \x20 search <owner> <keyword> [package|function|workspace]\n\
         \x20 sort <owner> <node_id> <sort>\n\
         \x20 history <runner_id> [page]\n\
         \x20 call <owner> <runner> <method> <route> [body]\n\
         defaults:\n\
         --config {}",
        DEFAULT_PLATFORM_CONFIG_PATH
    )
}

struct CtlOptions {
    config_path: PathBuf,
    command: String,
    args: Vec<String>,
}

fn parse_args() -> Result<CtlOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.is_empty() || args[0] == "-h" || args[0] == "--help" {
        return Err(usage());
    }

    let mut config_path = PathBuf::from(DEFAULT_PLATFORM_CONFIG_PATH);
    let mut rest = Vec::new();
    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = PathBuf::from(value);
            }
            other => rest.push(other.to_string()),
        }
        i += 1;
    }

    if rest.is_empty() {
        return Err(format!("missing command\n{}", usage()));
    }
    let command = rest.remove(0);
    Ok(CtlOptions {
        config_path,
        command,
        args: rest,
    })
}

fn arg<'a>(args: &'a [String], index: usize, name: &str) -> FnResult<&'a str> {
    args.get(index)
        .map(|s| s.as_str())
        .ok_or_else(|| FnError::InvalidParam(format!("missing <{}>", name)))
}

fn id_arg(args: &[String], index: usize, name: &str) -> FnResult<i64> {
    let value = arg(args, index, name)?;
    value
        .parse::<i64>()
        .map_err(|e| FnError::InvalidParam(format!("<{}> {}: {}", name, value, e)))
}

fn print_json<T: Serialize>(value: &T) -> FnResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(options: CtlOptions) -> FnResult<()> {
    let config = PlatformConfig::load(&options.config_path)?;
    let db = Arc::new(MetaDb::open(&config.meta_db_path)?);
    let tree = NamespaceTree::new(db.clone());
    let args = options.args.as_slice();

    match options.command.as_str() {
        "init-runner" => {
            let owner = arg(args, 0, "owner")?;
            let runner = RunnerRegistry::new(db.clone())
                .create_runner(owner, arg(args, 1, "name")?, arg(args, 2, "title")?, None, owner)
                .await?;
            print_json(&runner)
        }
        "mkdir" => {
            let node = tree
                .create(
                    arg(args, 0, "owner")?,
                    id_arg(args, 1, "parent_id")?,
                    NodeSpec::package(arg(args, 2, "name")?, ""),
                )
                .await?;
            print_json(&node)
        }
        "rename" => {
            let node = tree
                .rename(
                    arg(args, 0, "owner")?,
                    id_arg(args, 1, "node_id")?,
                    arg(args, 2, "name")?,
                )
                .await?;
            print_json(&node)
        }
        "mv" => {
            let node = tree
                .move_node(
                    arg(args, 0, "owner")?,
                    id_arg(args, 1, "node_id")?,
                    id_arg(args, 2, "parent_id")?,
                )
                .await?;
            print_json(&node)
        }
        "fork" => {
            let node = tree
                .fork(
                    id_arg(args, 0, "node_id")?,
                    id_arg(args, 1, "target_parent_id")?,
                    args.get(3).map(|s| s.as_str()),
                    arg(args, 2, "new_owner")?,
                )
                .await?;
            print_json(&node)
        }
        "rm" => {
            let node_id = id_arg(args, 1, "node_id")?;
            tree.delete(arg(args, 0, "owner")?, node_id).await?;
            print_json(&serde_json::json!({ "deleted": node_id }))
        }
        "tree" => {
            let view = tree
                .build_subtree(arg(args, 0, "owner")?, id_arg(args, 1, "root_id")?)
                .await?;
            eprintln!("{}", view.render_text());
            print_json(&view)
        }
        "search" => {
            let mut query = SearchQuery {
                keyword: arg(args, 1, "keyword")?.to_string(),
                ..Default::default()
            };
            match args.get(2).map(|s| s.as_str()) {
                None => {}
                Some("workspace") => query.workspace = true,
                Some(kind) => query.kind = Some(NodeKind::parse(kind)?),
            }
            let nodes = tree.search(arg(args, 0, "owner")?, &query).await?;
            print_json(&nodes)
        }
        "sort" => {
            let value = arg(args, 2, "sort")?;
            let sort = value
                .parse::<i64>()
                .map_err(|e| FnError::InvalidParam(format!("<sort> {}: {}", value, e)))?;
            let node = tree
                .set_sort(arg(args, 0, "owner")?, id_arg(args, 1, "node_id")?, sort)
                .await?;
            print_json(&node)
        }
        "history" => {
            let page = match args.get(1) {
                Some(v) => v
                    .parse::<u32>()
                    .map_err(|e| FnError::InvalidParam(format!("<page> {}: {}", v, e)))?,
                None => 1,
            };
            let history = VersionLedger::new(db.clone())
                .with_page_size_limit(config.history_page_size_limit())
                .history(id_arg(args, 0, "runner_id")?, page, 0)
                .await?;
            print_json(&history)
        }
        "call" => {
            let bus = connect_bus(&config.bus_endpoint()?).await?;
            let recorder = Arc::new(RunRecorder::start(
                Arc::new(DbRunRecordSink::new(db.clone())),
                config.run_record_queue_size(),
            ));
            let gateway = FunctionGateway::new(
                PathResolver::new(db.clone()),
                DispatchClient::new(bus, config.call_timeout()),
                recorder.clone(),
            );
            let route = arg(args, 3, "route")?;
            let (sub_route, raw_query) = match route.split_once('?') {
                Some((path, query)) => (path.to_string(), query.to_string()),
                None => (route.to_string(), String::new()),
            };
            let result = gateway
                .call(CallRequest {
                    owner: arg(args, 0, "owner")?.to_string(),
                    runner: arg(args, 1, "runner")?.to_string(),
                    method: arg(args, 2, "method")?.to_string(),
                    sub_route,
                    raw_query,
                    body: args.get(4).map(|b| b.as_bytes().to_vec()).unwrap_or_default(),
                    trace_id: None,
                })
                .await;
            recorder.shutdown().await;
            print_json(&result?)
        }
        other => Err(FnError::InvalidParam(format!(
            "unknown command: {}\n{}",
            other,
            usage()
        ))),
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run(options).await {
        error!("func_ctl failed: {}", err);
        std::process::exit(1);
    }
}
