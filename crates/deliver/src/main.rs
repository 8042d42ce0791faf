mod archive;
mod cli;
mod config;
mod hooks;
mod pipeline;
mod remote;
#[cfg(test)]
mod test_utils;

use crate::cli::{Args, Command};
use crate::config::{
    build_delivery_spec, config_search_paths, expand_tilde, home_dir, load_delivery_config,
};
use crate::pipeline::{DeliveryPipeline, DeliveryReport, PipelineOptions};
use anyhow::Context;
use clap::Parser;
use delivery_spec::{DeliverySpec, SocksProxy};
use serde::Serialize;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::time::Duration;
use tunnel_chain::socks::{parse_host_port, relay_stdio, SOCKS_PASSWORD_ENV, SOCKS_USER_ENV};
use tunnel_chain::{HopChain, SshOptions, SshSessionFactory, TunnelOptions};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    // stdout carries the ssh transport for socks-connect, so its logs go to stderr.
    let log_to_stderr =
        args.log_to_stderr || matches!(args.command, Some(Command::SocksConnect { .. }));
    if let Err(err) = init_tracing(log_to_stderr) {
        eprintln!("error: {err:#}");
        return ExitCode::FAILURE;
    }
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", one_line(&format!("{err:#}")));
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    match args.command {
        Some(Command::SocksConnect { ref proxy, ref target }) => socks_connect(proxy, target).await,
        Some(Command::List { json }) => {
            let spec = load_spec(&args)?;
            list_tasks(&spec, json)
        }
        None => {
            let Some(task) = args.task.clone() else {
                anyhow::bail!("missing task; run `deliver list` to see configured tasks");
            };
            run_task(&args, &task).await
        }
    }
}

fn load_spec(args: &Args) -> anyhow::Result<DeliverySpec> {
    let paths = config_search_paths(home_dir().as_deref(), &args.config);
    let config = load_delivery_config(&paths)?;
    Ok(build_delivery_spec(config)?)
}

async fn run_task(args: &Args, task: &str) -> anyhow::Result<()> {
    let spec = load_spec(args)?;
    let mut ssh_options = SshOptions::new(expand_tilde(&args.control_dir));
    ssh_options.ready_timeout = args.connect_timeout;
    let factory = SshSessionFactory::new(ssh_options)?;
    let work_dir = std::env::current_dir().context("failed to resolve working directory")?;
    let options = PipelineOptions {
        tunnel: TunnelOptions {
            idle_close_delay: Duration::from_millis(args.tunnel_idle_ms),
            ..TunnelOptions::default()
        },
        remote_tmp: args.remote_tmp.clone(),
        work_dir,
        stage_timeout: args.stage_timeout,
    };
    let pipeline = DeliveryPipeline::new(spec, Arc::new(factory), options);
    tokio::select! {
        result = pipeline.run(task) => {
            let report = result?;
            println!("{}", render_report(&report, args.json)?);
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(event = "delivery.interrupted", task = %task, "interrupted");
            anyhow::bail!("interrupted")
        }
    }
}

fn render_report(report: &DeliveryReport, json: bool) -> anyhow::Result<String> {
    if json {
        return Ok(serde_json::to_string_pretty(report)?);
    }
    Ok("delivery done".to_string())
}

#[derive(Serialize)]
struct TaskListing<'a> {
    task: &'a str,
    src: String,
    server: &'a str,
    path: &'a str,
    chain: Option<Vec<String>>,
    error: Option<String>,
}

fn list_tasks(spec: &DeliverySpec, json: bool) -> anyhow::Result<()> {
    let listings: Vec<TaskListing<'_>> = spec
        .tasks()
        .map(|task| {
            let chain = HopChain::resolve(spec, &task.dst.server_id);
            TaskListing {
                task: &task.id,
                src: task.src_path.display().to_string(),
                server: &task.dst.server_id,
                path: &task.dst.path,
                chain: chain
                    .as_ref()
                    .ok()
                    .map(|chain| chain.hops().iter().map(|hop| hop.id.clone()).collect()),
                error: chain.err().map(|err| err.to_string()),
            }
        })
        .collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&listings)?);
        return Ok(());
    }
    if listings.is_empty() {
        println!("no tasks configured");
    }
    for listing in &listings {
        let route = match (&listing.chain, &listing.error) {
            (Some(chain), _) => chain.join(" -> "),
            (None, Some(error)) => format!("unresolved: {error}"),
            (None, None) => String::new(),
        };
        println!(
            "{}\t{} -> {}:{}\t[{}]",
            listing.task, listing.src, listing.server, listing.path, route
        );
    }
    Ok(())
}

async fn socks_connect(proxy: &str, target: &str) -> anyhow::Result<()> {
    let (proxy_host, proxy_port) = parse_host_port(proxy)?;
    let (host, port) = parse_host_port(target)?;
    let proxy = SocksProxy {
        host: proxy_host,
        port: proxy_port,
        user: std::env::var(SOCKS_USER_ENV).ok(),
        password: std::env::var(SOCKS_PASSWORD_ENV).ok(),
    };
    relay_stdio(&proxy, &host, port).await?;
    Ok(())
}

fn one_line(message: &str) -> String {
    message
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
}

fn init_tracing(log_to_stderr: bool) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
    );
    if log_to_stderr {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use delivery_spec::{ServerSpec, TaskSpec};

    #[test]
    fn one_line_joins_multiline_errors() {
        assert_eq!(
            one_line("connecting: ssh failed\n  Permission denied\n\n"),
            "connecting: ssh failed; Permission denied"
        );
    }

    #[test]
    fn report_renders_as_json_on_request() {
        let report = DeliveryReport {
            task: "app".to_string(),
            chain: vec!["a".to_string(), "b".to_string()],
            tunnels: 1,
            archive_bytes: 10,
            remote_archive: "/tmp/x.tgz".to_string(),
            destination: "/srv/app".to_string(),
            elapsed_ms: 1500,
        };
        assert_eq!(render_report(&report, false).unwrap(), "delivery done");
        let value: serde_json::Value =
            serde_json::from_str(&render_report(&report, true).unwrap()).unwrap();
        assert_eq!(value["task"], "app");
        assert_eq!(value["chain"][1], "b");
        assert_eq!(value["tunnels"], 1);
        assert_eq!(value["elapsed_ms"], 1500);
    }

    #[test]
    fn listing_reports_unresolved_chains() {
        let spec = DeliverySpec::new(
            vec![
                ServerSpec::new("a", "a.example"),
                ServerSpec::new("b", "b.example").with_via("a"),
            ],
            vec![
                TaskSpec::new("ok", "./dist", "b", "/srv"),
                TaskSpec::new("broken", "./dist", "ghost", "/srv"),
            ],
        )
        .unwrap();
        list_tasks(&spec, true).unwrap();
        let chain = HopChain::resolve(&spec, "b").unwrap();
        assert_eq!(chain.describe(), "a -> b");
        assert!(HopChain::resolve(&spec, "ghost").is_err());
    }
}
