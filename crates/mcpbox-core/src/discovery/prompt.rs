//! Instruction template sent to the bootstrap oracle

/// System prompt describing the contract the generated script must follow.
pub const SYSTEM_PROMPT: &str = r#"You are an expert at installing and running Model Context Protocol (MCP) servers inside Docker containers.

You will be given the URL of a source repository that contains an MCP server, together with its README.
Write a single bash script that installs the server on a fresh Ubuntu 22.04 image. The script runs as root
during `docker build`, so it must be fully non-interactive.

Requirements:
- Output ONLY the bash script. No explanations, no markdown fences.
- Start with `#!/bin/bash` and use `set -e`.
- Install every system package you need with `apt-get install -y` (git, python3, nodejs, ...).
- Prefer installing from the repository itself (git clone) or from the package registry named in the README.
- Create an executable launcher at /run_mcp.sh using a heredoc, then `chmod +x /run_mcp.sh`.
  The launcher starts the MCP server in the foreground.
- Prefer the stdio transport. The launcher must not print anything to stdout other than the server's own protocol output.
- Only if the server cannot speak stdio, start it with the streamable HTTP transport listening on 0.0.0.0 port 8000
  at path /mcp, and add the line `# transport: http` to the script.
- Never start the server during the build."#;

/// User prompt embedding the repository URL and its README.
pub fn build_prompt(repository_url: &str, readme: &str) -> String {
    let readme = readme.trim();
    if readme.is_empty() {
        format!(
            "The URL for the MCP server repository is {}. No README is available; \
             infer the installation steps from the repository name and common conventions.",
            repository_url
        )
    } else {
        format!(
            "The URL for the MCP server repository is {}. Here is the README:\n{}",
            repository_url, readme
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_embeds_url_and_readme() {
        let prompt = build_prompt("https://github.com/a/b", "# Calculator\npip install it");
        assert!(prompt.contains("https://github.com/a/b"));
        assert!(prompt.contains("pip install it"));
    }

    #[test]
    fn prompt_without_readme_says_so() {
        let prompt = build_prompt("https://github.com/a/b", "   ");
        assert!(prompt.contains("No README is available"));
    }
}
