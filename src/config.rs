use minijinja::Environment;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Templating error: {0:?}")]
    Template(#[from] minijinja::Error),
    #[error("Invalid listen address: {0}")]
    Listen(#[from] std::net::AddrParseError),
    #[error("Watcher command must not be empty")]
    EmptyWatcherCommand,
}

#[derive(Debug, Default, Clone)]
pub struct AgentVars {
    inner: HashMap<String, String>,
}

impl<'de> Deserialize<'de> for AgentVars {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let inner = HashMap::deserialize(deserializer)?;
        Ok(Self { inner })
    }
}

impl Serialize for AgentVars {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.inner.serialize(serializer)
    }
}

/// Files that match stevedore.vars | *.stevedore.vars
/// Sorted
fn list_vars_files() -> Vec<PathBuf> {
    let mut files = Vec::new();
    let cli_args = crate::cli::get_cli_args();

    let search_dir = cli_args.config.parent().map_or(Path::new("."), |p| {
        if p.as_os_str().is_empty() {
            Path::new(".")
        } else {
            p
        }
    });
    if let Ok(entries) = std::fs::read_dir(search_dir) {
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_file() {
                if let Some(file_name) = path.file_name().and_then(|s| s.to_str()) {
                    if file_name == "stevedore.vars" || file_name.ends_with(".stevedore.vars") {
                        files.push(path);
                    }
                }
            }
        }
    }

    files.sort(); // Sort the paths alphabetically
    files
}

impl AgentVars {
    fn try_init_from_string(val: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(val)?)
    }

    fn combine(vars: Vec<Self>) -> Self {
        let mut combined_inner = HashMap::new();
        vars.into_iter().for_each(|var_set| {
            combined_inner.extend(var_set.inner);
        });
        Self {
            inner: combined_inner,
        }
    }

    fn try_init() -> Result<Self, ConfigError> {
        use std::io::Read;
        let mut vars = Vec::new();
        let vars_files = list_vars_files();
        for vars_file in vars_files {
            match std::fs::File::open(vars_file) {
                Ok(mut file) => {
                    let mut this_vars = String::new();
                    file.read_to_string(&mut this_vars)?;
                    match Self::try_init_from_string(&this_vars) {
                        Ok(this_vars) => vars.push(this_vars),
                        Err(e) => log::error!("Error parsing vars file: {e}"),
                    }
                }
                Err(e) => log::error!("Error reading vars file: {e}"),
            }
        }

        Ok(Self::combine(vars))
    }
}

pub fn render_template(template_str: &str, vars: &AgentVars) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();

    let syntax = minijinja::syntax::SyntaxConfig::builder()
        .variable_delimiters("${", "}")
        .build()
        .expect("This really should not fail. If this fail something has gone horribly wrong.");

    env.set_syntax(syntax);
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);

    let template = env.template_from_str(template_str)?;
    Ok(template.render(vars)?)
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub core: CoreSection,
    #[serde(default)]
    pub watcher: WatcherSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    /// Address the management API listens on.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Shared secret used to authenticate inbound requests.
    pub secret: String,
    /// Maximum age in seconds of an authenticated request timestamp.
    #[serde(default = "default_replay_window")]
    pub replay_window: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoreSection {
    /// Base URL of the core control plane.
    pub url: String,
    /// Name this agent reports itself as.
    pub name: String,
    pub token: String,
    /// Timeout in seconds for each event delivery attempt.
    #[serde(default = "default_core_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherSection {
    /// Command line of the event-source subprocess.
    #[serde(default = "default_watch_command")]
    pub command: Vec<String>,
    /// Container actions that are never forwarded to core.
    #[serde(default = "default_ignored_actions")]
    pub ignored_actions: Vec<String>,
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            command: default_watch_command(),
            ignored_actions: default_ignored_actions(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:7070".to_string()
}

fn default_replay_window() -> u64 {
    300
}

fn default_core_timeout() -> u64 {
    10
}

fn default_watch_command() -> Vec<String> {
    ["docker", "events", "--format", "{{json .}}"]
        .into_iter()
        .map(String::from)
        .collect()
}

pub(crate) fn default_ignored_actions() -> Vec<String> {
    vec!["stop".to_string(), "kill".to_string()]
}

impl AgentConfig {
    fn try_init_from_string(config: &str, vars: &AgentVars) -> Result<Self, ConfigError> {
        let rendered = render_template(config, vars)?;

        let config: Self = toml::from_str(&rendered)?;
        if config.watcher.command.is_empty() {
            return Err(ConfigError::EmptyWatcherCommand);
        }
        Ok(config)
    }

    pub fn try_init() -> Result<Self, ConfigError> {
        use std::io::Read;
        let mut config = String::new();
        std::fs::File::open(&crate::cli::get_cli_args().config)?.read_to_string(&mut config)?;
        let vars = AgentVars::try_init()?;

        Self::try_init_from_string(&config, &vars)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(self.agent.listen.parse()?)
    }

    pub fn core_timeout(&self) -> Duration {
        Duration::from_secs(self.core.timeout)
    }

    pub fn replay_window(&self) -> Duration {
        Duration::from_secs(self.agent.replay_window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_vars(entries: &[(&str, &str)]) -> AgentVars {
        let inner = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AgentVars { inner }
    }

    #[test]
    fn test_vars_parsing() {
        let input = r#"
            var1 = "value1"
            var2 = "value2"
        "#;
        let vars = AgentVars::try_init_from_string(input).expect("Failed to parse vars");
        assert_eq!(vars.inner.get("var1").map(|s| s.as_str()), Some("value1"));
        assert_eq!(vars.inner.get("var2").map(|s| s.as_str()), Some("value2"));
    }

    #[test]
    fn test_config_loading_with_templates() {
        let vars = make_vars(&[("core_token", "t0k3n"), ("agent_secret", "s3cret")]);

        let config_input = r#"
            [agent]
            secret = "${ agent_secret }"

            [core]
            url = "https://core.example.com"
            name = "host-17"
            token = "${ core_token }"
        "#;

        let config =
            AgentConfig::try_init_from_string(config_input, &vars).expect("Failed to parse config");

        assert_eq!(config.agent.secret, "s3cret");
        assert_eq!(config.core.token, "t0k3n");
        assert_eq!(config.core.name, "host-17");
        // Defaults
        assert_eq!(config.agent.listen, "0.0.0.0:7070");
        assert_eq!(config.agent.replay_window, 300);
        assert_eq!(config.core.timeout, 10);
        assert_eq!(
            config.watcher.command,
            vec!["docker", "events", "--format", "{{json .}}"]
        );
        assert_eq!(config.watcher.ignored_actions, vec!["stop", "kill"]);
    }

    #[test]
    fn test_watcher_overrides() {
        let vars = AgentVars::default();
        let config_input = r#"
            [agent]
            secret = "s"

            [core]
            url = "http://localhost:9000"
            name = "dev"
            token = "t"
            timeout = 3

            [watcher]
            command = ["cat", "/tmp/events.jsonl"]
            ignored_actions = []
        "#;

        let config = AgentConfig::try_init_from_string(config_input, &vars).unwrap();
        assert_eq!(config.watcher.command, vec!["cat", "/tmp/events.jsonl"]);
        assert!(config.watcher.ignored_actions.is_empty());
        assert_eq!(config.core_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_watcher_command_must_not_be_empty() {
        let vars = AgentVars::default();
        let config_input = r#"
            [agent]
            secret = "s"

            [core]
            url = "http://localhost:9000"
            name = "dev"
            token = "t"

            [watcher]
            command = []
        "#;

        let res = AgentConfig::try_init_from_string(config_input, &vars);
        assert!(matches!(res, Err(ConfigError::EmptyWatcherCommand)));
    }

    #[test]
    fn test_template_failure() {
        let vars = AgentVars::default();
        let config_input = r#"
            [agent]
            secret = "${ missing_secret }"

            [core]
            url = "https://core.example.com"
            name = "host-17"
            token = "t"
        "#;

        let res = AgentConfig::try_init_from_string(config_input, &vars);
        assert!(matches!(res, Err(ConfigError::Template(_))), "{:?}", res);
    }

    #[test]
    fn test_event_source_format_braces_survive_rendering() {
        // The default docker events format string uses Go template braces.
        // The ${ } variable syntax must leave them untouched.
        let vars = AgentVars::default();
        let rendered = render_template("docker events --format '{{json .}}'", &vars).unwrap();
        assert_eq!(rendered, "docker events --format '{{json .}}'");
    }

    #[test]
    fn test_listen_addr_parsing() {
        let vars = AgentVars::default();
        let config_input = r#"
            [agent]
            listen = "127.0.0.1:8099"
            secret = "s"

            [core]
            url = "http://localhost:9000"
            name = "dev"
            token = "t"
        "#;

        let config = AgentConfig::try_init_from_string(config_input, &vars).unwrap();
        let addr = config.listen_addr().unwrap();
        assert_eq!(addr.port(), 8099);
    }
}
