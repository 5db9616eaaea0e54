use anyhow::{anyhow, bail, Context, Result};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5810;
pub const DEFAULT_LOG_FILTER: &str = "info";

const USAGE: &str = "usage: eheart-server [-H|--host HOST] [-p|--port PORT]";

/// Server settings. Defaults are overridden by `EHEART_HOST`, `EHEART_PORT`
/// and `RUST_LOG`, which are in turn overridden by command-line flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_filter: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_env_and_args() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.apply_args(std::env::args().skip(1))?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("EHEART_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("EHEART_PORT") {
            self.port = parse_port(&port).context("invalid EHEART_PORT")?;
        }
        if let Some(filter) = lookup("RUST_LOG") {
            self.log_filter = filter;
        }
        Ok(())
    }

    pub fn apply_args<I>(&mut self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        while let Some(flag) = args.next() {
            let mut value = || {
                args.next()
                    .ok_or_else(|| anyhow!("missing value for {flag}\n{USAGE}"))
            };
            match flag.as_str() {
                "-H" | "--host" => self.host = value()?,
                "-p" | "--port" => self.port = parse_port(&value()?)?,
                _ => bail!("unknown argument `{flag}`\n{USAGE}"),
            }
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_port(text: &str) -> Result<u16> {
    text.trim()
        .parse()
        .with_context(|| format!("`{text}` is not a valid port"))
}
