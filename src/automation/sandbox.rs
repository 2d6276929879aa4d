//! 用户沙箱：文件编辑与 Shell
//!
//! 所有路径都相对 `<root>/<user>/`，按词法规范化后必须仍在该目录内（拒绝绝对路径与越界的 `..`）。
//! 只做词法检查，不解析符号链接。

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use crate::automation::actions::EditorCommand;
use crate::core::RelayError;

/// 空用户 ID 使用的目录名
const ANONYMOUS_USER: &str = "anonymous";

#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
    shell_timeout: Duration,
}

fn file_not_exist() -> RelayError {
    RelayError::Execution("Error: File not exist.".to_string())
}

fn io_error(e: std::io::Error) -> RelayError {
    RelayError::Execution(format!("Error: {}", e))
}

impl Sandbox {
    pub fn new(root: impl Into<PathBuf>, shell_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            shell_timeout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 用户目录 `<root>/<user>/`
    pub fn user_dir(&self, user: &str) -> Result<PathBuf, RelayError> {
        let user = if user.is_empty() { ANONYMOUS_USER } else { user };
        let single_segment = matches!(
            Path::new(user).components().collect::<Vec<_>>().as_slice(),
            [Component::Normal(_)]
        );
        if !single_segment {
            return Err(RelayError::Execution(format!("Error: invalid user id '{}'", user)));
        }
        Ok(self.root.join(user))
    }

    /// 把调用方给出的相对路径解析到用户目录内
    pub fn resolve(&self, user: &str, relative: &str) -> Result<PathBuf, RelayError> {
        let base = self.user_dir(user)?;
        let rel = Path::new(relative.trim());
        let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(p) => parts.push(p),
                Component::CurDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(escape_error(relative));
                    }
                }
                Component::RootDir | Component::Prefix(_) => return Err(escape_error(relative)),
            }
        }
        if parts.is_empty() {
            return Err(RelayError::Execution("Error: path is required.".to_string()));
        }
        Ok(parts.into_iter().fold(base, |acc, p| acc.join(p)))
    }

    pub async fn ensure_user_dir(&self, user: &str) -> Result<PathBuf, RelayError> {
        let dir = self.user_dir(user)?;
        tokio::fs::create_dir_all(&dir).await.map_err(io_error)?;
        Ok(dir)
    }

    /// 读取沙箱文件；不存在时返回 None
    pub async fn read_bytes(&self, user: &str, relative: &str) -> Result<Option<(PathBuf, Vec<u8>)>, RelayError> {
        let path = self.resolve(user, relative)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some((path, bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(e)),
        }
    }

    /// 追加写入（文件不存在则创建）
    pub async fn append(&self, user: &str, relative: &str, text: &str) -> Result<PathBuf, RelayError> {
        use tokio::io::AsyncWriteExt;

        let path = self.resolve(user, relative)?;
        write_parent(&path).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_error)?;
        file.write_all(text.as_bytes()).await.map_err(io_error)?;
        file.flush().await.map_err(io_error)?;
        Ok(path)
    }

    /// 文本编辑器命令
    pub async fn edit(&self, user: &str, command: &EditorCommand) -> Result<String, RelayError> {
        match command {
            EditorCommand::Create { path, file_text } => {
                let full = self.resolve(user, path)?;
                write_parent(&full).await?;
                tokio::fs::write(&full, file_text).await.map_err(io_error)?;
                Ok(format!("File created: {}", path))
            }
            EditorCommand::View { path, view_range } => {
                let text = self.read_text(user, path).await?;
                Ok(match view_range {
                    Some([start, end]) => view_lines(&text, *start, *end),
                    None => text,
                })
            }
            EditorCommand::StrReplace { path, old_str, new_str } => {
                let full = self.resolve(user, path)?;
                let mut text = self.read_text(user, path).await?;
                match old_str {
                    None => {
                        text.push('\n');
                        text.push_str(new_str);
                    }
                    Some(old) if !old.is_empty() && text.contains(old.as_str()) => {
                        text = text.replace(old.as_str(), new_str);
                    }
                    // 未命中时不改动文件
                    Some(_) => {
                        return Err(RelayError::Execution(format!("Error: old_str not found in {}", path)));
                    }
                }
                tokio::fs::write(&full, text).await.map_err(io_error)?;
                Ok(format!("File edited: {}", path))
            }
            EditorCommand::Insert {
                path,
                insert_line,
                new_str,
            } => {
                let full = self.resolve(user, path)?;
                let text = self.read_text(user, path).await?;
                let mut lines: Vec<&str> = text.split('\n').collect();
                if *insert_line < 1 || *insert_line as usize > lines.len() {
                    return Err(RelayError::Execution("Error: insert_line out of range.".to_string()));
                }
                lines.insert(*insert_line as usize - 1, new_str.as_str());
                tokio::fs::write(&full, lines.join("\n")).await.map_err(io_error)?;
                Ok(format!("Inserted at line {} of {}", insert_line, path))
            }
            EditorCommand::UndoEdit { .. } => Err(RelayError::Execution("Error: I can't undo edit.".to_string())),
        }
    }

    async fn read_text(&self, user: &str, relative: &str) -> Result<String, RelayError> {
        let full = self.resolve(user, relative)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(file_not_exist()),
            Err(e) => Err(io_error(e)),
        }
    }

    /// 在用户目录中执行一条命令；stderr 非空即视为失败
    pub async fn run_shell(&self, user: &str, command: &str) -> Result<String, RelayError> {
        let dir = self.ensure_user_dir(user).await?;
        tracing::info!(user = %user, command = %command, "sandbox shell execute");

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command).current_dir(&dir).kill_on_drop(true);

        let output = tokio::time::timeout(self.shell_timeout, cmd.output())
            .await
            .map_err(|_| RelayError::Execution(format!("Error: command timed out after {}s", self.shell_timeout.as_secs())))?
            .map_err(|e| RelayError::Execution(format!("Error: {}", e)))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            return Err(RelayError::Execution(format!("Error:{}", stderr)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// 按扩展名推断附件 MIME
pub fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

fn escape_error(relative: &str) -> RelayError {
    RelayError::Execution(format!("Error: path '{}' escapes the sandbox.", relative))
}

async fn write_parent(path: &Path) -> Result<(), RelayError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
    }
    Ok(())
}

/// 1 起始的闭区间；结束为 -1 表示到末尾
fn view_lines(text: &str, start: i64, end: i64) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    let from = (start.max(1) - 1) as usize;
    let to = if end == -1 {
        lines.len()
    } else {
        (end.max(0) as usize).min(lines.len())
    };
    if from >= to {
        return String::new();
    }
    lines[from..to].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(dir: &tempfile::TempDir) -> Sandbox {
        Sandbox::new(dir.path(), Duration::from_secs(10))
    }

    #[test]
    fn test_resolve_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(&dir);
        assert!(sb.resolve("u1", "../u2/secret.txt").is_err());
        assert!(sb.resolve("u1", "/etc/passwd").is_err());
        assert!(sb.resolve("../x", "a.txt").is_err());
        let ok = sb.resolve("u1", "notes/../report.md").unwrap();
        assert_eq!(ok, dir.path().join("u1").join("report.md"));
    }

    #[tokio::test]
    async fn test_create_then_view_inclusive_range() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(&dir);
        sb.edit(
            "u1",
            &EditorCommand::Create {
                path: "a.txt".into(),
                file_text: "l1\nl2\nl3\nl4".into(),
            },
        )
        .await
        .unwrap();
        let view = |range| EditorCommand::View {
            path: "a.txt".into(),
            view_range: Some(range),
        };
        assert_eq!(sb.edit("u1", &view([2, 3])).await.unwrap(), "l2\nl3");
        assert_eq!(sb.edit("u1", &view([3, -1])).await.unwrap(), "l3\nl4");
    }

    #[tokio::test]
    async fn test_view_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = sandbox(&dir)
            .edit(
                "u1",
                &EditorCommand::View {
                    path: "none.txt".into(),
                    view_range: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.detail(), "Error: File not exist.");
    }

    #[tokio::test]
    async fn test_str_replace_and_append() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(&dir);
        sb.append("u1", "a.txt", "hello world").await.unwrap();
        sb.edit(
            "u1",
            &EditorCommand::StrReplace {
                path: "a.txt".into(),
                old_str: Some("world".into()),
                new_str: "rust".into(),
            },
        )
        .await
        .unwrap();
        sb.edit(
            "u1",
            &EditorCommand::StrReplace {
                path: "a.txt".into(),
                old_str: None,
                new_str: "tail".into(),
            },
        )
        .await
        .unwrap();
        let text = std::fs::read_to_string(dir.path().join("u1/a.txt")).unwrap();
        assert_eq!(text, "hello rust\ntail");
    }

    #[tokio::test]
    async fn test_str_replace_missing_old_str_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(&dir);
        sb.append("u1", "a.txt", "hello world").await.unwrap();
        let replace = |old: &str| EditorCommand::StrReplace {
            path: "a.txt".into(),
            old_str: Some(old.into()),
            new_str: "REPLACEMENT".into(),
        };

        let err = sb.edit("u1", &replace("nonexistent")).await.unwrap_err();
        assert_eq!(err.detail(), "Error: old_str not found in a.txt");
        assert!(sb.edit("u1", &replace("")).await.is_err());
        let text = std::fs::read_to_string(dir.path().join("u1/a.txt")).unwrap();
        assert_eq!(text, "hello world");
    }

    #[tokio::test]
    async fn test_insert_range_checked() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(&dir);
        sb.append("u1", "a.txt", "a\nb").await.unwrap();
        let insert = |line| EditorCommand::Insert {
            path: "a.txt".into(),
            insert_line: line,
            new_str: "x".into(),
        };
        assert!(sb.edit("u1", &insert(3)).await.is_err());
        assert!(sb.edit("u1", &insert(0)).await.is_err());
        sb.edit("u1", &insert(2)).await.unwrap();
        let text = std::fs::read_to_string(dir.path().join("u1/a.txt")).unwrap();
        assert_eq!(text, "a\nx\nb");
    }

    #[test]
    fn test_mime_by_extension() {
        assert_eq!(mime_for(Path::new("r.MD")), "text/markdown");
        assert_eq!(mime_for(Path::new("noext")), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_undo_not_supported() {
        let dir = tempfile::tempdir().unwrap();
        let err = sandbox(&dir)
            .edit("u1", &EditorCommand::UndoEdit { path: "a.txt".into() })
            .await
            .unwrap_err();
        assert!(err.detail().contains("can't undo"));
    }

    #[tokio::test]
    async fn test_shell_runs_in_user_dir_and_fails_on_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(&dir);
        sb.append("u1", "marker.txt", "x").await.unwrap();
        let out = sb.run_shell("u1", "ls").await.unwrap();
        assert!(out.contains("marker.txt"));

        let err = sb.run_shell("u1", "echo oops 1>&2").await.unwrap_err();
        assert!(err.detail().starts_with("Error:"));
        assert!(err.detail().contains("oops"));
    }
}
