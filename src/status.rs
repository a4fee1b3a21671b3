use crate::config::{BotConfig, APK_URL_VAR, TOKEN_VAR};
use crate::downloader::{validate_archive, InvalidArchive};
use colored::*;
use log::warn;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageState {
    Missing,
    Invalid(String),
    Valid { size: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolState {
    pub name: String,
    pub resolved: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub token_present: bool,
    pub url_present: bool,
    pub base_path: PathBuf,
    pub base: PackageState,
    pub tools: Vec<ToolState>,
}

impl StatusReport {
    pub fn is_ready(&self) -> bool {
        self.token_present
            && matches!(self.base, PackageState::Valid { .. })
            && self.tools.iter().all(|t| t.resolved.is_some())
    }

    /// Colour-coded rendering for the terminal.
    pub fn print(&self) {
        let mark = |ok: bool| if ok { "✓".green() } else { "✗".red() };

        println!("{}", "Bot Status".bold());
        println!("==========");
        println!("{} {TOKEN_VAR} configured", mark(self.token_present));
        println!("{} {APK_URL_VAR} configured", mark(self.url_present));
        match &self.base {
            PackageState::Valid { size } => println!(
                "{} Base package {} ({})",
                mark(true),
                self.base_path.display(),
                format_bytes(*size)
            ),
            PackageState::Missing => println!(
                "{} Base package {} is missing",
                mark(false),
                self.base_path.display()
            ),
            PackageState::Invalid(reason) => println!(
                "{} Base package {} is invalid: {}",
                mark(false),
                self.base_path.display(),
                reason.yellow()
            ),
        }
        for tool in &self.tools {
            match &tool.resolved {
                Some(path) => println!("{} {} → {}", mark(true), tool.name, path.display()),
                None => println!("{} {} not found on PATH", mark(false), tool.name),
            }
        }
        if self.is_ready() {
            println!("{}", "Ready to personalize packages.".green());
        } else {
            println!("{}", "Not ready.".red());
        }
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let yes_no = |ok: bool| if ok { "✅" } else { "❌" };

        writeln!(f, "📊 Bot status")?;
        writeln!(f, "{} Bot token configured", yes_no(self.token_present))?;
        writeln!(f, "{} APK link configured", yes_no(self.url_present))?;
        match &self.base {
            PackageState::Valid { size } => {
                writeln!(f, "✅ Base package present and valid ({})", format_bytes(*size))?
            }
            PackageState::Missing => writeln!(f, "❌ Base package missing")?,
            PackageState::Invalid(reason) => writeln!(f, "❌ Base package invalid: {reason}")?,
        }
        for tool in &self.tools {
            writeln!(f, "{} {} available", yes_no(tool.resolved.is_some()), tool.name)?;
        }
        write!(f, "{}", if self.is_ready() { "Ready." } else { "Not ready." })
    }
}

/// Read-only environment checks, shared by the CLI and the bot.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    config: BotConfig,
}

impl Diagnostics {
    pub fn new(config: &BotConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Filesystem and PATH lookups run on the blocking pool.
    pub async fn report(&self) -> StatusReport {
        let config = self.config.clone();
        let checks = tokio::task::spawn_blocking(move || inspect_environment(&config)).await;
        let (base, tools) = match checks {
            Ok(checks) => checks,
            Err(e) => {
                warn!("Environment check did not complete: {e}");
                let tools = tool_names(&self.config)
                    .into_iter()
                    .map(|name| ToolState { name, resolved: None })
                    .collect();
                (PackageState::Invalid(e.to_string()), tools)
            }
        };

        StatusReport {
            token_present: self.config.token.is_some(),
            url_present: self.config.apk_url.is_some(),
            base_path: self.config.base_package.clone(),
            base,
            tools,
        }
    }
}

fn tool_names(config: &BotConfig) -> Vec<String> {
    let mut names = vec![config.tools.apktool.clone()];
    if config.tools.signer != config.tools.apktool {
        names.push(config.tools.signer.clone());
    }
    names
}

fn inspect_environment(config: &BotConfig) -> (PackageState, Vec<ToolState>) {
    let base = match validate_archive(&config.base_package, config.min_base_size) {
        Ok(size) => PackageState::Valid { size },
        Err(InvalidArchive::Missing) => PackageState::Missing,
        Err(problem) => PackageState::Invalid(problem.to_string()),
    };
    let tools = tool_names(config)
        .into_iter()
        .map(|name| ToolState {
            resolved: which::which(&name).ok(),
            name,
        })
        .collect();
    (base, tools)
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
