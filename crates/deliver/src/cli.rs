use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "deliver",
    version,
    about = "Deliver a local directory to a remote host, through a chain of ssh hops",
    args_conflicts_with_subcommands = true
)]
pub(crate) struct Args {
    /// Config file; may be repeated. Merged after ~/.deliveryrc.toml and ~/.delivery.toml.
    #[arg(long, global = true, default_value = "delivery.toml")]
    pub(crate) config: Vec<PathBuf>,
    #[arg(long, global = true, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
    /// Delay before an idle tunnel listener is closed.
    #[arg(long, default_value_t = 2)]
    pub(crate) tunnel_idle_ms: u64,
    /// How long an ssh session may take to authenticate.
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub(crate) connect_timeout: Duration,
    /// Upper bound for each delivery stage that does I/O.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub(crate) stage_timeout: Option<Duration>,
    /// Remote directory the archive is uploaded to.
    #[arg(long, default_value = "/tmp")]
    pub(crate) remote_tmp: String,
    #[arg(long, default_value = "~/.deliver/control")]
    pub(crate) control_dir: String,
    /// Print the delivery report as JSON instead of `delivery done`.
    #[arg(long, default_value_t = false)]
    pub(crate) json: bool,
    /// Task to run.
    pub(crate) task: Option<String>,
    #[command(subcommand)]
    pub(crate) command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Print configured tasks and the hop chain of their destination.
    List {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Relay stdin/stdout to `--target` through a SOCKS5 proxy (ssh ProxyCommand helper).
    #[command(name = "socks-connect", hide = true)]
    SocksConnect {
        #[arg(long)]
        proxy: String,
        #[arg(long)]
        target: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_run_uses_defaults() {
        let args = Args::try_parse_from(["deliver", "site"]).unwrap();
        assert_eq!(args.task.as_deref(), Some("site"));
        assert_eq!(args.config, vec![PathBuf::from("delivery.toml")]);
        assert_eq!(args.tunnel_idle_ms, 2);
        assert_eq!(args.connect_timeout, Duration::from_secs(30));
        assert_eq!(args.stage_timeout, None);
        assert_eq!(args.remote_tmp, "/tmp");
        assert!(!args.json);
        assert!(args.command.is_none());
    }

    #[test]
    fn task_run_can_report_json() {
        let args = Args::try_parse_from(["deliver", "--json", "site"]).unwrap();
        assert!(args.json);
        assert_eq!(args.task.as_deref(), Some("site"));
    }

    #[test]
    fn repeated_config_and_durations() {
        let args = Args::try_parse_from([
            "deliver",
            "--config",
            "a.toml",
            "--config",
            "b.toml",
            "--stage-timeout",
            "2m",
            "--connect-timeout",
            "5s",
            "site",
        ])
        .unwrap();
        assert_eq!(
            args.config,
            vec![PathBuf::from("a.toml"), PathBuf::from("b.toml")]
        );
        assert_eq!(args.stage_timeout, Some(Duration::from_secs(120)));
        assert_eq!(args.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn list_subcommand_accepts_global_config() {
        let args = Args::try_parse_from(["deliver", "list", "--json", "--config", "x.toml"]).unwrap();
        assert!(matches!(args.command, Some(Command::List { json: true })));
        assert_eq!(args.config, vec![PathBuf::from("x.toml")]);
        assert!(args.task.is_none());
    }

    #[test]
    fn socks_connect_requires_proxy_and_target() {
        let args = Args::try_parse_from([
            "deliver",
            "socks-connect",
            "--proxy",
            "127.0.0.1:1080",
            "--target",
            "a.example:22",
        ])
        .unwrap();
        match args.command {
            Some(Command::SocksConnect { proxy, target }) => {
                assert_eq!(proxy, "127.0.0.1:1080");
                assert_eq!(target, "a.example:22");
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(Args::try_parse_from(["deliver", "socks-connect", "--proxy", "p:1"]).is_err());
    }
}
