//! Runtime configuration for the demo binary: CLI flags layered over
//! environment variables and a dotfile, following the teacher's
//! `clap` + `ortho_config` + `figment` stack.

use clap::Parser;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

/// Runtime configuration shared by the demo binary.
#[derive(clap::Args, OrthoConfig, Serialize, Deserialize, Default, Debug, Clone)]
#[ortho_config(prefix = "AVRO_RPC_")]
pub struct AppConfig {
    /// Proxy bind address.
    #[ortho_config(default = "0.0.0.0:8080".to_owned())]
    #[arg(long, default_value_t = String::from("0.0.0.0:8080"))]
    pub bind: String,
    /// URL path prefix `POST` scope parsing strips before reading the
    /// trailing scope segment.
    #[ortho_config(default = "/".to_owned())]
    #[arg(long, default_value_t = String::from("/"))]
    pub post_scope_prefix: String,
    /// `CallContext` local key under which trace state is stored.
    #[ortho_config(default = "trace".to_owned())]
    #[arg(long, default_value_t = String::from("trace"))]
    pub trace_key: String,
    /// Skip the handshake round-trip on every opened channel.
    #[ortho_config(default = false)]
    #[arg(long, default_value_t = false)]
    pub no_ping: bool,
}

/// Top-level CLI entry point consumed by the demo binary.
#[derive(Parser, Deserialize, Serialize, Debug, Clone)]
pub struct Cli {
    /// Application configuration.
    #[command(flatten)]
    pub config: AppConfig,
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn env_config_loading() {
        Jail::expect_with(|j| {
            j.set_env("AVRO_RPC_BIND", "127.0.0.1:9000");
            let cfg = AppConfig::load_from_iter(["avro-rpc-demo"]).expect("load");
            assert_eq!(cfg.bind, "127.0.0.1:9000");
            Ok(())
        });
    }

    #[test]
    fn cli_overrides_env() {
        Jail::expect_with(|j| {
            j.set_env("AVRO_RPC_BIND", "127.0.0.1:9000");
            let cfg = AppConfig::load_from_iter(["avro-rpc-demo", "--bind", "0.0.0.0:7000"]).expect("load");
            assert_eq!(cfg.bind, "0.0.0.0:7000");
            Ok(())
        });
    }

    #[test]
    fn defaults_apply_with_no_overrides() {
        Jail::expect_with(|_j| {
            let cfg = AppConfig::load_from_iter(["avro-rpc-demo"]).expect("load");
            assert_eq!(cfg.post_scope_prefix, "/");
            assert_eq!(cfg.trace_key, "trace");
            assert!(!cfg.no_ping);
            Ok(())
        });
    }
}
