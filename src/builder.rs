use crate::config::BotConfig;
use crate::conversation::Personalizer;
use crate::downloader::{BasePackage, FetchError};
use crate::request::{TargetUrl, UserId};
use log::{error, info, warn};
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::{fs, process::Command};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preparing,
    Unpacking,
    Injecting,
    Repacking,
    Signing,
    Finalizing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Preparing => "preparing base package",
            Stage::Unpacking => "unpacking",
            Stage::Injecting => "injecting assets",
            Stage::Repacking => "repacking",
            Stage::Signing => "signing",
            Stage::Finalizing => "finalizing",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{stage} failed ({status}): {diagnostic}")]
    ToolFailed {
        stage: Stage,
        status: ExitStatus,
        diagnostic: String,
    },
    #[error("{stage} timed out after {}s", after.as_secs())]
    TimedOut { stage: Stage, after: Duration },
    #[error("{stage} failed: could not run {program}: {source}")]
    Spawn {
        stage: Stage,
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{stage} failed: {source}")]
    Io {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },
    #[error("signing failed: no file ending in {suffix} was produced")]
    SignedNotFound { suffix: String },
    #[error("preparing base package failed: {0}")]
    BasePackage(#[source] FetchError),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::ToolFailed { stage, .. }
            | PipelineError::TimedOut { stage, .. }
            | PipelineError::Spawn { stage, .. }
            | PipelineError::Io { stage, .. } => *stage,
            PipelineError::SignedNotFound { .. } => Stage::Signing,
            PipelineError::BasePackage(_) => Stage::Preparing,
        }
    }
}

fn io_error(stage: Stage) -> impl Fn(std::io::Error) -> PipelineError {
    move |source| PipelineError::Io { stage, source }
}

/// A signed, personalized package. Owns the working directory it lives in;
/// both go away on `discard` or drop.
#[derive(Debug)]
pub struct Artifact {
    dir: TempDir,
    path: PathBuf,
    file_name: String,
}

impl Artifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    #[cfg(test)]
    pub(crate) fn for_tests(dir: TempDir, path: PathBuf, file_name: String) -> Self {
        Self {
            dir,
            path,
            file_name,
        }
    }

    pub fn discard(self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove artifact {}: {e}", self.path.display());
        }
        remove_work_dir(self.dir);
    }
}

fn remove_work_dir(dir: TempDir) {
    let path = dir.path().to_path_buf();
    if let Err(e) = dir.close() {
        warn!("Failed to remove working directory {}: {e}", path.display());
    }
}

pub struct Builder {
    config: BotConfig,
    base: Arc<BasePackage>,
}

impl Builder {
    pub fn new(config: BotConfig, base: Arc<BasePackage>) -> Self {
        Self { config, base }
    }

    /// Unpack, inject, repack and sign the base package for one user.
    pub async fn personalize(
        &self,
        user: UserId,
        url: &TargetUrl,
    ) -> Result<Artifact, PipelineError> {
        info!("Starting APK creation for user {user}");

        let work = tempfile::Builder::new()
            .prefix("magnet-")
            .tempdir_in(self.config.work_root())
            .map_err(io_error(Stage::Preparing))?;
        info!("→ Created working directory: {}", work.path().display());

        match self.run_stages(work.path(), user, url).await {
            Ok(path) => {
                info!("✓ APK created successfully for user {user}");
                Ok(Artifact {
                    dir: work,
                    path,
                    file_name: self.config.artifact_file_name(user.0),
                })
            }
            Err(e) => {
                error!("APK creation for user {user} failed: {e}");
                remove_work_dir(work);
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        work: &Path,
        user: UserId,
        url: &TargetUrl,
    ) -> Result<PathBuf, PipelineError> {
        let tools = &self.config.tools;
        let decompiled = work.join("decompiled");

        {
            let (_guard, _) = self
                .base
                .acquire()
                .await
                .map_err(PipelineError::BasePackage)?;
            run_tool(
                Stage::Unpacking,
                &tools.apktool,
                &[
                    OsStr::new("d"),
                    self.base.path().as_os_str(),
                    OsStr::new("-o"),
                    decompiled.as_os_str(),
                    OsStr::new("-f"),
                ],
                tools.unpack_timeout(),
            )
            .await?;
        }

        self.inject(&decompiled, user, url).await?;

        let unsigned = work.join("unsigned.apk");
        run_tool(
            Stage::Repacking,
            &tools.apktool,
            &[
                OsStr::new("b"),
                decompiled.as_os_str(),
                OsStr::new("-o"),
                unsigned.as_os_str(),
            ],
            tools.repack_timeout(),
        )
        .await?;

        run_tool(
            Stage::Signing,
            &tools.signer,
            &[
                OsStr::new("-a"),
                unsigned.as_os_str(),
                OsStr::new("-o"),
                work.as_os_str(),
                OsStr::new("--allowResign"),
            ],
            tools.sign_timeout(),
        )
        .await?;

        let signed = find_signed(work, &tools.signed_suffix).await?;
        let final_path = work.join(self.config.artifact_file_name(user.0));
        fs::rename(&signed, &final_path)
            .await
            .map_err(io_error(Stage::Finalizing))?;
        info!("✓ Moved signed APK to: {}", final_path.display());

        Ok(final_path)
    }

    async fn inject(
        &self,
        decompiled: &Path,
        user: UserId,
        url: &TargetUrl,
    ) -> Result<(), PipelineError> {
        let assets_dir = decompiled.join("assets");
        fs::create_dir_all(&assets_dir)
            .await
            .map_err(io_error(Stage::Injecting))?;

        fs::write(assets_dir.join(&self.config.id_asset), user.to_string())
            .await
            .map_err(io_error(Stage::Injecting))?;
        fs::write(assets_dir.join(&self.config.url_asset), url.as_str())
            .await
            .map_err(io_error(Stage::Injecting))?;

        info!("✓ Assets modified successfully");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Personalizer for Builder {
    async fn personalize(&self, user: UserId, url: &TargetUrl) -> Result<Artifact, PipelineError> {
        Builder::personalize(self, user, url).await
    }
}

fn tool_command(program: &str) -> Command {
    if cfg!(target_os = "windows") {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(program);
        cmd
    } else {
        Command::new(program)
    }
}

async fn run_tool(
    stage: Stage,
    program: &str,
    args: &[&OsStr],
    limit: Duration,
) -> Result<(), PipelineError> {
    info!("→ {stage} with {program}...");

    let mut command = tool_command(program);
    command.args(args).stdin(Stdio::null()).kill_on_drop(true);

    let output = match tokio::time::timeout(limit, command.output()).await {
        Err(_) => return Err(PipelineError::TimedOut { stage, after: limit }),
        Ok(Err(source)) => {
            return Err(PipelineError::Spawn {
                stage,
                program: program.to_string(),
                source,
            })
        }
        Ok(Ok(output)) => output,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let diagnostic = if stderr.trim().is_empty() {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        return Err(PipelineError::ToolFailed {
            stage,
            status: output.status,
            diagnostic,
        });
    }

    info!("✓ {stage} finished");
    Ok(())
}

/// The signer names its output after the input; pick it up by suffix.
async fn find_signed(dir: &Path, suffix: &str) -> Result<PathBuf, PipelineError> {
    let mut entries = fs::read_dir(dir).await.map_err(io_error(Stage::Signing))?;
    while let Some(entry) = entries.next_entry().await.map_err(io_error(Stage::Signing))? {
        if entry.file_name().to_string_lossy().ends_with(suffix) {
            return Ok(entry.path());
        }
    }

    Err(PipelineError::SignedNotFound {
        suffix: suffix.to_string(),
    })
}
