//! Post-processing of oracle output: fence stripping, validation and
//! inference of run command and transport.

use regex::Regex;

use crate::errors::DiscoveryError;
use crate::types::{TransportKind, DEFAULT_RUN_COMMAND};

/// Commands a generated script plausibly starts with when it has no shebang.
const LEADING_COMMANDS: &[&str] = &[
    "apt", "apt-get", "apk", "yum", "dnf", "set", "cd", "git", "pip", "pip3", "python", "python3",
    "npm", "npx", "node", "uv", "uvx", "curl", "wget", "export", "mkdir", "echo", "source", "cat",
    "chmod", "bash", "sh", "cargo", "go", "if", "for", "rm", "cp", "mv", "ln", "tee", "printf",
    "sudo", "make", "corepack", "yarn", "pnpm", "bun", "deno", "pipx", "poetry",
];

/// Removes a markdown code fence wrapping the whole script, if present.
pub fn strip_code_fence(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }

    let mut lines: Vec<&str> = trimmed.lines().collect();
    // Opening fence, possibly with a language tag
    lines.remove(0);
    if lines.last().map(|l| l.trim_start().starts_with("```")).unwrap_or(false) {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

/// Best-effort check that the text is a shell script rather than prose.
pub fn validate_script(script: &str) -> Result<(), DiscoveryError> {
    let trimmed = script.trim();
    if trimmed.is_empty() {
        return Err(DiscoveryError::MalformedScript("script is empty".to_string()));
    }
    if trimmed.starts_with("#!") {
        return Ok(());
    }

    let first = trimmed
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .ok_or_else(|| DiscoveryError::MalformedScript("script contains only comments".to_string()))?;

    let token = first.split_whitespace().next().unwrap_or_default();
    let assignment = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=")
        .map_err(|e| DiscoveryError::MalformedScript(e.to_string()))?;

    let looks_like_command = LEADING_COMMANDS.contains(&token)
        || token.starts_with('/')
        || token.starts_with("./")
        || assignment.is_match(token);

    if looks_like_command {
        Ok(())
    } else {
        Err(DiscoveryError::MalformedScript(format!(
            "first line does not look like a shell command: '{}'",
            first.chars().take(80).collect::<String>()
        )))
    }
}

/// Path of the launcher the script creates, defaulting to `/run_mcp.sh`.
///
/// A heredoc-written `*.sh` that is also made executable wins; otherwise the
/// first heredoc-written `*.sh`.
pub fn infer_run_command(script: &str) -> String {
    let heredoc_patterns = [
        r#"cat\s+<<-?\s*['"]?\w+['"]?\s*>\s*(/[\w./-]+\.sh)"#,
        r#"cat\s*>\s*(/[\w./-]+\.sh)\s*<<"#,
        r#"tee\s+(/[\w./-]+\.sh)\s*(?:>\s*/dev/null\s*)?<<"#,
    ];
    let mut written: Vec<(usize, String)> = Vec::new();
    for pattern in heredoc_patterns {
        let Ok(re) = Regex::new(pattern) else { continue };
        for caps in re.captures_iter(script) {
            if let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) {
                written.push((whole.start(), path.as_str().to_string()));
            }
        }
    }
    written.sort_by_key(|(offset, _)| *offset);

    let executable: Vec<String> = Regex::new(r"chmod\s+(?:[ugoa]*\+x|[0-7]{3,4})\s+(/[\w./-]+\.sh)")
        .map(|re| {
            re.captures_iter(script)
                .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
                .collect()
        })
        .unwrap_or_default();

    written
        .iter()
        .find(|(_, path)| executable.contains(path))
        .or_else(|| written.first())
        .map(|(_, path)| path.clone())
        .unwrap_or_else(|| DEFAULT_RUN_COMMAND.to_string())
}

/// How the launched server is reached, as inferred from the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHint {
    pub kind: TransportKind,
    /// Port the server listens on inside the container, when stated.
    pub port: Option<u16>,
    /// Streamable HTTP endpoint path, when stated.
    pub path: Option<String>,
}

impl TransportHint {
    fn stream() -> Self {
        Self {
            kind: TransportKind::Stream,
            port: None,
            path: None,
        }
    }

    fn network(script: &str) -> Self {
        Self {
            kind: TransportKind::Network,
            port: stated_port(script),
            path: stated_endpoint_path(script),
        }
    }
}

/// STREAM unless the script declares or launches a streamable HTTP server.
///
/// Legacy SSE servers (`GET /sse` plus `POST /messages`) are not spoken by the
/// HTTP transport, so `sse` alone never selects NETWORK.
pub fn infer_transport(script: &str, readme: &str) -> TransportHint {
    if let Ok(marker) = Regex::new(r"(?im)^\s*#\s*transport:\s*([\w-]+)") {
        if let Some(caps) = marker.captures(script) {
            return match caps[1].to_ascii_lowercase().as_str() {
                "http" | "network" | "streamable-http" | "streamable_http" => TransportHint::network(script),
                other => {
                    if other == "sse" {
                        log::warn!("Script declares legacy SSE transport, falling back to STREAM");
                    }
                    TransportHint::stream()
                }
            };
        }
    }

    let http_launch = Regex::new(
        r"(?i)--transport[\s=]+['\x22]?(?:streamable[-_]?http|http)\b|transport\s*=\s*['\x22](?:streamable[-_]?http|http)['\x22]",
    );
    let launches_http = http_launch.map(|re| re.is_match(script)).unwrap_or(false);
    let has_port = stated_port(script).is_some();
    let readme_mentions_stdio = readme.to_ascii_lowercase().contains("stdio");

    if launches_http && (has_port || !readme_mentions_stdio) {
        TransportHint::network(script)
    } else {
        TransportHint::stream()
    }
}

fn stated_port(script: &str) -> Option<u16> {
    let re = Regex::new(r"(?i)--port[\s=]+['\x22]?(\d{1,5})\b|\bPORT=['\x22]?(\d{1,5})\b").ok()?;
    let port = re
        .captures_iter(script)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .filter_map(|m| m.as_str().parse::<u16>().ok())
        .find(|port| *port != 0);
    port
}

fn stated_endpoint_path(script: &str) -> Option<String> {
    let re = Regex::new(r"(?i)--(?:path|endpoint|mount-path|streamable-http-path)[\s=]+['\x22]?(/[\w./-]*)").ok()?;
    re.captures(script).and_then(|caps| caps.get(1)).map(|m| m.as_str().to_string())
}
