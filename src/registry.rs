//! Registry credentials for image pulls.
//!
//! Resolves credentials from the host's `~/.docker/config.json`, preferring
//! per-registry credential helpers, then the global credential store, then
//! plain base64 auth entries. Pulls proceed anonymously when nothing is found.

use base64::Engine;
use bollard::auth::DockerCredentials;
use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;

#[derive(serde::Deserialize, Debug)]
struct AuthEntry {
    auth: Option<String>,
}

#[derive(serde::Deserialize, Debug)]
struct DockerConfig {
    auths: Option<HashMap<String, AuthEntry>>,
    #[serde(rename = "credsHelpers")]
    creds_helpers: Option<HashMap<String, String>>,
    #[serde(rename = "credsStore")]
    creds_store: Option<String>,
}

fn get_docker_config_path() -> Result<PathBuf, Box<dyn Error>> {
    let home_dir = env::var("HOME")?;
    let docker_config_path = PathBuf::from(home_dir).join(".docker").join("config.json");
    Ok(docker_config_path)
}

fn read_docker_config() -> Result<DockerConfig, Box<dyn Error>> {
    let docker_config_path = get_docker_config_path()?;
    let file = BufReader::new(File::open(docker_config_path)?);
    let config: DockerConfig = serde_json::from_reader(file)?;
    Ok(config)
}

#[derive(serde::Deserialize)]
struct CredStoreOutput {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

fn call_credential_helper(
    helper: &str,
    registry: &str,
) -> Result<(String, String), Box<dyn Error>> {
    let command = format!("docker-credential-{}", helper);
    let mut process = Command::new(command)
        .arg("get")
        .stderr(Stdio::piped())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;

    let mut stdin = process.stdin.take().ok_or("No stdin on credential helper")?;
    stdin.write_all(registry.as_bytes())?;
    drop(stdin);

    let output = process.wait_with_output()?;
    let output_str = String::from_utf8(output.stdout)?;

    let creds: CredStoreOutput = serde_json::from_str(&output_str)?;
    Ok((creds.username, creds.secret))
}

fn decode_auth(auth: &str) -> Result<(String, String), Box<dyn Error>> {
    let decoded = base64::prelude::BASE64_STANDARD.decode(auth)?;
    let decoded_str = String::from_utf8(decoded)?;
    let parts: Vec<&str> = decoded_str.split(':').collect();

    if parts.len() != 2 {
        return Err("Invalid auth format".into());
    }

    Ok((parts[0].to_string(), parts[1].to_string()))
}

fn get_registry_credentials_internal(registry: &str) -> Result<(String, String), Box<dyn Error>> {
    let config = read_docker_config()?;

    if let Some(cred_helpers) = config.creds_helpers {
        if let Some(helper) = cred_helpers.get(registry) {
            let helper_str = helper.as_str();
            return call_credential_helper(helper_str, registry);
        }
    }

    if let Some(helper) = config.creds_store {
        let helper_str = helper.as_str();
        return call_credential_helper(helper_str, registry);
    }

    // Fallback to plain text credentials from "auths"
    if let Some(auths) = config.auths {
        if let Some(auth_entry) = auths.get(registry) {
            if let Some(auth) = auth_entry.auth.as_ref() {
                return decode_auth(auth);
            }
        }
    }

    Err("No credentials found".into())
}

/// Registry portion of an image reference: everything before the first `/`,
/// but only when it looks like a host (contains `.` or `:`), per the
/// reference grammar Docker itself applies. Defaults to Docker Hub.
pub fn registry_of(image: &str) -> &str {
    match image.split_once('/') {
        Some((host, _)) if host.contains('.') || host.contains(':') => host,
        _ => "https://index.docker.io/v1/",
    }
}

/// Best-effort credential lookup for the registry that hosts `image`.
/// Returns `None` when no credentials are configured, leaving the pull
/// anonymous.
pub fn credentials_for_image(image: &str) -> Option<DockerCredentials> {
    let registry = registry_of(image);
    match get_registry_credentials_internal(registry) {
        Ok((username, password)) => Some(DockerCredentials {
            username: Some(username),
            password: Some(password),
            serveraddress: Some(registry.to_string()),
            ..Default::default()
        }),
        Err(e) => {
            log::debug!("No registry credentials for {registry}: {e}");
            None
        }
    }
}
