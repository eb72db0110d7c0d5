//! `ralph docs`: open or print documentation URLs.
//!
//! Prefers the repository's own github origin when the working directory has
//! one; falls back to the canonical project URL.

use std::path::Path;
use std::process::Command;

use regex::Regex;
use tracing::debug;

use crate::cli::{DocsArgs, DocsSection};

const DEFAULT_DOCS_BASE: &str = "https://github.com/ralph-tui/ralph";

/// Resolve the section URL and open (or print) it. Returns the exit code.
pub fn docs(cwd: &Path, args: &DocsArgs) -> i32 {
    let base = github_origin(cwd).unwrap_or_else(|| DEFAULT_DOCS_BASE.to_string());
    let url = section_url(&base, args.section);

    if args.print {
        println!("{url}");
        return 0;
    }
    match open_in_browser(&url) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Could not open a browser ({e}); URL: {url}");
            1
        }
    }
}

/// The https URL of the `origin` remote, when it points at github.
/// Handles SSH and HTTPS spellings, with or without `.git`.
pub fn github_origin(cwd: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["remote", "get-url", "origin"])
        .current_dir(cwd)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let raw = String::from_utf8_lossy(&output.stdout).trim().to_string();
    parse_github_url(&raw)
}

pub fn parse_github_url(raw: &str) -> Option<String> {
    let re = Regex::new(
        r"^(?:git@github\.com:|ssh://git@github\.com/|https://github\.com/)([\w.-]+)/([\w.-]+?)(?:\.git)?/?$",
    )
    .ok()?;
    let caps = re.captures(raw)?;
    let owner = caps.get(1)?.as_str();
    let repo = caps.get(2)?.as_str();
    Some(format!("https://github.com/{owner}/{repo}"))
}

fn section_url(base: &str, section: DocsSection) -> String {
    match section {
        DocsSection::Readme => format!("{base}#readme"),
        DocsSection::Config => format!("{base}/blob/main/docs/configuration.md"),
        DocsSection::Agents => format!("{base}/blob/main/docs/agents.md"),
        DocsSection::Trackers => format!("{base}/blob/main/docs/trackers.md"),
        DocsSection::Troubleshooting => format!("{base}/blob/main/docs/troubleshooting.md"),
    }
}

fn open_in_browser(url: &str) -> std::io::Result<()> {
    let (program, args): (&str, Vec<&str>) = if cfg!(target_os = "macos") {
        ("open", vec![url])
    } else if cfg!(target_os = "windows") {
        ("cmd", vec!["/C", "start", url])
    } else {
        ("xdg-open", vec![url])
    };
    debug!(category = "cli", program, url, "Opening docs");
    Command::new(program).args(args).spawn().map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_github_ssh() {
        assert_eq!(
            parse_github_url("git@github.com:acme/widgets.git").as_deref(),
            Some("https://github.com/acme/widgets")
        );
        assert_eq!(
            parse_github_url("git@github.com:acme/widgets").as_deref(),
            Some("https://github.com/acme/widgets")
        );
    }

    #[test]
    fn test_parse_github_https() {
        assert_eq!(
            parse_github_url("https://github.com/acme/widgets.git").as_deref(),
            Some("https://github.com/acme/widgets")
        );
        assert_eq!(
            parse_github_url("https://github.com/acme/widgets/").as_deref(),
            Some("https://github.com/acme/widgets")
        );
    }

    #[test]
    fn test_parse_non_github_rejected() {
        assert!(parse_github_url("https://gitlab.com/acme/widgets.git").is_none());
        assert!(parse_github_url("git@bitbucket.org:acme/widgets.git").is_none());
    }

    #[test]
    fn test_section_urls() {
        assert_eq!(
            section_url(DEFAULT_DOCS_BASE, DocsSection::Readme),
            "https://github.com/ralph-tui/ralph#readme"
        );
        assert!(section_url(DEFAULT_DOCS_BASE, DocsSection::Troubleshooting)
            .ends_with("docs/troubleshooting.md"));
    }

    #[test]
    fn test_origin_fallback_outside_repo() {
        let temp = tempfile::TempDir::new().unwrap();
        assert!(github_origin(temp.path()).is_none());
    }
}
