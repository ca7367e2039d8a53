use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::raft::types::{NodeId, NodeMeta};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "routeplane",
    about = "Replicated routing-table control plane",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the control plane node (default).
    Run,

    /// Print the cluster status reported by a running node.
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// Control API base URL of the node to ask.
    #[arg(
        long,
        env = "RP_STATUS_URL",
        value_name = "URL",
        default_value = "http://127.0.0.1:9090"
    )]
    pub url: String,

    /// Print the raw JSON instead of a summary.
    #[arg(long)]
    pub json: bool,
}

/// Another voter named on the command line as `ID=URL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSpec {
    pub id: NodeId,
    pub url: String,
}

fn parse_peer(raw: &str) -> Result<PeerSpec, String> {
    let (id, url) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected ID=URL, got {raw:?}"))?;
    let id = id
        .trim()
        .parse::<NodeId>()
        .map_err(|e| format!("invalid peer id {id:?}: {e}"))?;
    if id == 0 {
        return Err("peer id must be >= 1".to_string());
    }
    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(format!("peer url must start with http:// or https://, got {url:?}"));
    }
    Ok(PeerSpec {
        id,
        url: url.trim_end_matches('/').to_string(),
    })
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "RP_NODE_ID",
        value_name = "ID",
        default_value_t = 1,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub node_id: NodeId,

    #[arg(
        long,
        global = true,
        env = "RP_NODE_NAME",
        value_name = "NAME",
        default_value = "node-1"
    )]
    pub node_name: String,

    #[arg(
        long,
        global = true,
        env = "RP_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:9090"
    )]
    pub bind: SocketAddr,

    /// URL other nodes and clients use to reach this node; serves both the control API and
    /// `/raft/*`.
    #[arg(
        long,
        global = true,
        env = "RP_API_BASE_URL",
        value_name = "ORIGIN",
        default_value = "http://127.0.0.1:9090"
    )]
    pub api_base_url: String,

    #[arg(
        long,
        global = true,
        env = "RP_DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    #[arg(
        long,
        global = true,
        env = "RP_CLUSTER_NAME",
        value_name = "NAME",
        default_value = "routeplane"
    )]
    pub cluster_name: String,

    /// Initialize a new cluster from this node and `--peer` if no raft state exists yet.
    #[arg(
        long,
        global = true,
        env = "RP_BOOTSTRAP",
        value_name = "BOOL",
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true",
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub bootstrap: bool,

    /// Initial voter other than this node, as `ID=URL`. Repeatable.
    #[arg(
        long = "peer",
        global = true,
        env = "RP_PEERS",
        value_name = "ID=URL",
        value_delimiter = ',',
        value_parser = parse_peer
    )]
    pub peers: Vec<PeerSpec>,

    #[arg(
        long = "write-timeout-ms",
        global = true,
        env = "RP_WRITE_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 5_000,
        value_parser = clap::value_parser!(u64).range(100..=600_000)
    )]
    pub write_timeout_ms: u64,

    #[arg(
        long = "heartbeat-interval-ms",
        global = true,
        env = "RP_HEARTBEAT_INTERVAL_MS",
        value_name = "MS",
        default_value_t = 500,
        value_parser = clap::value_parser!(u64).range(10..=60_000)
    )]
    pub heartbeat_interval_ms: u64,

    #[arg(
        long = "election-timeout-min-ms",
        global = true,
        env = "RP_ELECTION_TIMEOUT_MIN_MS",
        value_name = "MS",
        default_value_t = 1_500,
        value_parser = clap::value_parser!(u64).range(20..=300_000)
    )]
    pub election_timeout_min_ms: u64,

    #[arg(
        long = "election-timeout-max-ms",
        global = true,
        env = "RP_ELECTION_TIMEOUT_MAX_MS",
        value_name = "MS",
        default_value_t = 3_000,
        value_parser = clap::value_parser!(u64).range(30..=600_000)
    )]
    pub election_timeout_max_ms: u64,

    #[arg(
        long = "snapshot-threshold",
        global = true,
        env = "RP_SNAPSHOT_THRESHOLD",
        value_name = "ENTRIES",
        default_value_t = 1024,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub snapshot_threshold: u64,

    #[arg(
        long = "snapshot-interval-secs",
        global = true,
        env = "RP_SNAPSHOT_INTERVAL_SECS",
        value_name = "SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..=86_400)
    )]
    pub snapshot_interval_secs: u64,

    #[arg(
        long = "snapshot-retain",
        global = true,
        env = "RP_SNAPSHOT_RETAIN",
        value_name = "N",
        default_value_t = 2,
        value_parser = clap::value_parser!(u64).range(1..=64)
    )]
    pub snapshot_retain: u64,

    #[arg(
        long = "trailing-logs",
        global = true,
        env = "RP_TRAILING_LOGS",
        value_name = "ENTRIES",
        default_value_t = 1024
    )]
    pub trailing_logs: u64,
}

impl Config {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn node_meta(&self) -> NodeMeta {
        let url = self.api_base_url.trim_end_matches('/').to_string();
        NodeMeta {
            name: self.node_name.clone(),
            api_base_url: url.clone(),
            raft_endpoint: url,
        }
    }

    /// Voters for bootstrap: this node plus every `--peer`.
    pub fn initial_members(&self) -> BTreeMap<NodeId, NodeMeta> {
        let mut members = BTreeMap::new();
        for peer in &self.peers {
            members.insert(
                peer.id,
                NodeMeta {
                    name: format!("node-{}", peer.id),
                    api_base_url: peer.url.clone(),
                    raft_endpoint: peer.url.clone(),
                },
            );
        }
        members.insert(self.node_id, self.node_meta());
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_flags_absent() {
        let cli = Cli::try_parse_from(["routeplane"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config.node_id, 1);
        assert_eq!(cli.config.bind, "127.0.0.1:9090".parse().unwrap());
        assert_eq!(cli.config.data_dir, PathBuf::from("./data"));
        assert!(!cli.config.bootstrap);
        assert!(cli.config.peers.is_empty());
        assert_eq!(cli.config.write_timeout(), Duration::from_secs(5));
        assert_eq!(cli.config.snapshot_interval_secs, 30);
        assert_eq!(cli.config.snapshot_retain, 2);
        assert_eq!(cli.config.snapshot_threshold, 1024);
    }

    #[test]
    fn bootstrap_accepts_bare_flag_and_bool_value() {
        let cli = Cli::try_parse_from(["routeplane", "--bootstrap"]).unwrap();
        assert!(cli.config.bootstrap);

        let cli = Cli::try_parse_from(["routeplane", "--bootstrap", "false"]).unwrap();
        assert!(!cli.config.bootstrap);
    }

    #[test]
    fn parses_repeated_peers_into_members() {
        let cli = Cli::try_parse_from([
            "routeplane",
            "run",
            "--node-id",
            "2",
            "--api-base-url",
            "http://10.0.0.2:9090/",
            "--peer",
            "1=http://10.0.0.1:9090",
            "--peer",
            "3=http://10.0.0.3:9090/",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Command::Run)));
        assert_eq!(
            cli.config.peers,
            vec![
                PeerSpec {
                    id: 1,
                    url: "http://10.0.0.1:9090".to_string()
                },
                PeerSpec {
                    id: 3,
                    url: "http://10.0.0.3:9090".to_string()
                },
            ]
        );

        let members = cli.config.initial_members();
        assert_eq!(members.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(members[&2].api_base_url, "http://10.0.0.2:9090");
        assert_eq!(members[&3].raft_endpoint, "http://10.0.0.3:9090");
    }

    #[test]
    fn rejects_malformed_peer() {
        for bad in ["nourl", "x=http://a", "0=http://a", "1=ftp://a"] {
            let err = Cli::try_parse_from(["routeplane", "--peer", bad]).unwrap_err();
            assert!(err.to_string().contains("--peer"), "{bad}: {err}");
        }
    }

    #[test]
    fn rejects_invalid_node_id() {
        let err = Cli::try_parse_from(["routeplane", "--node-id", "0"]).unwrap_err();
        assert!(err.to_string().contains("--node-id"));
    }

    #[test]
    fn rejects_invalid_write_timeout_ms() {
        let err = Cli::try_parse_from(["routeplane", "--write-timeout-ms", "10"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--write-timeout-ms"));
        assert!(msg.contains("100..=600000"));
    }

    #[test]
    fn status_subcommand_takes_url() {
        let cli =
            Cli::try_parse_from(["routeplane", "status", "--url", "http://10.0.0.1:9090"]).unwrap();
        let Some(Command::Status(args)) = cli.command else {
            panic!("expected status subcommand");
        };
        assert_eq!(args.url, "http://10.0.0.1:9090");
        assert!(!args.json);
    }
}
