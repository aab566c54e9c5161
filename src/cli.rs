//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use bookrelay::config::{
    DEFAULT_SMTP_PORT, ServerConfig, SmtpConfig, sanitize_base_path, search_interval_from_secs,
};

/// Relay a single browser session to an IRC ebook bot.
///
/// Searches and downloads are forwarded to the bot; finished books can be
/// mailed to a Kindle address over SMTP.
#[derive(Parser, Debug)]
#[command(name = "bookrelay")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// HTTP port to listen on
    #[arg(short, long, default_value_t = 5228)]
    pub port: u16,

    /// Path prefix the app is served under
    #[arg(long, env = "BASE_PATH", default_value = "/")]
    pub basepath: String,

    /// Keep books on disk after they are delivered
    #[arg(long)]
    pub persist: bool,

    /// Download root; books land in <dir>/books
    #[arg(short, long, default_value_os_t = std::env::temp_dir().join("bookrelay"))]
    pub dir: PathBuf,

    /// Seconds between accepted searches (values below 10 are raised to 10)
    #[arg(short = 'r', long, default_value_t = 10)]
    pub rate_limit: u64,

    /// Base for the generated IRC nickname
    #[arg(short, long, default_value = "")]
    pub name: String,

    /// IRC server address (host:port)
    #[arg(short, long, default_value = "irc.irchighway.net:6667")]
    pub server: String,

    /// Connect to the IRC server over TLS
    #[arg(long)]
    pub tls: bool,

    /// Bot that receives search commands
    #[arg(long, default_value = "search")]
    pub searchbot: String,

    /// Write IRC traffic to <dir>/logs/<nickname>.log
    #[arg(long)]
    pub log: bool,

    /// Version string reported to CTCP VERSION requests
    #[arg(long, default_value = concat!("bookrelay ", env!("CARGO_PKG_VERSION")))]
    pub user_agent: String,

    #[arg(long, env = "SMTP_ENABLED", hide = true)]
    pub smtp_enabled: bool,

    #[arg(long, env = "SMTP_HOST", hide = true, default_value = "")]
    pub smtp_host: String,

    #[arg(long, env = "SMTP_PORT", hide = true, default_value_t = DEFAULT_SMTP_PORT)]
    pub smtp_port: u16,

    #[arg(long, env = "SMTP_USERNAME", hide = true, default_value = "")]
    pub smtp_username: String,

    #[arg(long, env = "SMTP_PASSWORD", hide = true, hide_env_values = true, default_value = "")]
    pub smtp_password: String,

    #[arg(long, env = "SMTP_FROM", hide = true, default_value = "")]
    pub smtp_from: String,
}

impl Args {
    /// Resolves flags into the runtime configuration.
    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            base_path: sanitize_base_path(&self.basepath),
            persist: self.persist,
            download_dir: self.dir,
            log_agent: self.log,
            user_name: self.name,
            user_agent: self.user_agent,
            server_address: self.server,
            enable_tls: self.tls,
            search_bot: self.searchbot,
            search_interval: search_interval_from_secs(self.rate_limit),
            smtp: SmtpConfig {
                enabled: self.smtp_enabled,
                host: self.smtp_host,
                port: self.smtp_port,
                username: self.smtp_username,
                password: self.smtp_password,
                from: self.smtp_from,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_cli_default_args_parses_successfully() {
        let args = Args::try_parse_from(["bookrelay"]).unwrap();
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert_eq!(args.port, 5228);
        assert_eq!(args.rate_limit, 10);
        assert_eq!(args.server, "irc.irchighway.net:6667");
        assert_eq!(args.searchbot, "search");
        assert!(!args.persist);
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["bookrelay", "-v"]).unwrap();
        assert_eq!(args.verbose, 1);

        let args = Args::try_parse_from(["bookrelay", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_quiet_flag_sets_quiet() {
        let args = Args::try_parse_from(["bookrelay", "--quiet"]).unwrap();
        assert!(args.quiet);
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let err = Args::try_parse_from(["bookrelay", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_invalid_flag_returns_error() {
        let err = Args::try_parse_from(["bookrelay", "--invalid-flag"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }

    #[test]
    fn test_cli_rate_limit_below_floor_is_clamped() {
        let config = Args::try_parse_from(["bookrelay", "-r", "3"])
            .unwrap()
            .into_config();
        assert_eq!(config.search_interval, Duration::from_secs(10));

        let config = Args::try_parse_from(["bookrelay", "--rate-limit", "30"])
            .unwrap()
            .into_config();
        assert_eq!(config.search_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_cli_basepath_is_sanitized() {
        let config = Args::try_parse_from(["bookrelay", "--basepath", "relay"])
            .unwrap()
            .into_config();
        assert_eq!(config.base_path, "/relay/");
    }

    #[test]
    fn test_cli_dir_sets_books_dir() {
        let config = Args::try_parse_from(["bookrelay", "-d", "/srv/relay", "--persist"])
            .unwrap()
            .into_config();
        assert_eq!(config.books_dir(), PathBuf::from("/srv/relay/books"));
        assert!(config.persist);
    }

    #[test]
    fn test_cli_smtp_flags_map_to_config() {
        let config = Args::try_parse_from([
            "bookrelay",
            "--smtp-enabled",
            "--smtp-host",
            "smtp.example.com",
            "--smtp-port",
            "2525",
            "--smtp-from",
            "relay@example.com",
        ])
        .unwrap()
        .into_config();
        assert!(config.smtp.enabled);
        assert_eq!(config.smtp.server_addr(), "smtp.example.com:2525");
        assert_eq!(config.smtp.from, "relay@example.com");
        assert!(config.smtp.validate().is_ok());
    }
}
