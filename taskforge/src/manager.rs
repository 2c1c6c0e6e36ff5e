//! Resolves task ids to [`TaskConfig`]s stored on disk.
//!
//! Mirrors `gotask`'s `Manager`: a task id is looked up first as a standalone YAML document,
//! then as a `.sh` script (optionally with `<id>.1.sh`, `<id>.2.sh`, ... numbered children
//! assembled into a sequential step tree), then as a `.js` script. The first form found wins;
//! the others are never consulted.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::models::{Runtime, TaskConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskListItem {
    pub task_id: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ManagerError {
    #[error("task {0:?} not found")]
    NotFound(String),

    #[error("could not parse task {task_id:?}; {source}")]
    Parse {
        task_id: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("io error loading task {task_id:?}; {source}")]
    Io {
        task_id: String,
        #[source]
        source: std::io::Error,
    },
}

pub struct Manager {
    tasks_dir: PathBuf,
}

impl Manager {
    pub fn new(tasks_dir: impl Into<PathBuf>) -> Self {
        Self {
            tasks_dir: tasks_dir.into(),
        }
    }

    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    /// Resolves `task_id` to its [`TaskConfig`], trying `.yaml`, then `.sh`, then `.js` in turn.
    pub async fn load(&self, task_id: &str) -> Result<TaskConfig, ManagerError> {
        let mut task = TaskConfig::new(task_id);
        task.dir = self.tasks_dir.to_string_lossy().into_owned();

        match self.load_yaml(task_id, &mut task).await {
            Ok(()) => {}
            Err(ManagerError::NotFound(_)) => match self.load_sh(task_id, &mut task).await {
                Ok(()) => {
                    task.command = format!("./{task_id}.sh");
                }
                Err(ManagerError::NotFound(_)) => {
                    self.load_js(task_id, &mut task).await?;
                    task.command = format!("./{task_id}.js");
                }
                Err(e) => return Err(e),
            },
            Err(e) => return Err(e),
        }

        task.fix_dependencies();
        Ok(task)
    }

    async fn load_yaml(&self, task_id: &str, task: &mut TaskConfig) -> Result<(), ManagerError> {
        let path = self.tasks_dir.join(format!("{task_id}.yaml"));
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ManagerError::NotFound(task_id.to_string()))
            }
            Err(e) => {
                return Err(ManagerError::Io {
                    task_id: task_id.to_string(),
                    source: e,
                })
            }
        };
        let mut loaded: TaskConfig =
            serde_yaml::from_slice(&bytes).map_err(|e| ManagerError::Parse {
                task_id: task_id.to_string(),
                source: e,
            })?;
        let task_id_owned = std::mem::take(&mut task.task_id);
        let dir = std::mem::take(&mut task.dir);
        // `serde_yaml` replaces the whole struct rather than merging fields into the
        // pre-populated `task` the way the original's field-at-a-time `yaml.Unmarshal` into an
        // already-`Name`-set struct does, so a YAML body that omits `name` or `dir` needs the
        // same fallback applied here explicitly.
        if loaded.name.is_empty() {
            loaded.name = task_id_owned.clone();
        }
        if loaded.dir.is_empty() {
            loaded.dir = dir;
        }
        *task = loaded;
        task.task_id = task_id_owned;
        Ok(())
    }

    /// Loads `<id>.sh` as the task's own command, and folds in any `<id>.<n>.sh` children as
    /// sequential steps. Recurses through `loadSh` for each numbered child so an arbitrarily
    /// deep chain (`foo.1.sh`, `foo.1.1.sh`, ...) resolves the same way a bare task id would.
    async fn load_sh(&self, task_id: &str, task: &mut TaskConfig) -> Result<(), ManagerError> {
        task.name = task_id.to_string();
        task.sequential = true;

        let own_script = self.tasks_dir.join(format!("{task_id}.sh"));
        if fs::metadata(&own_script).await.is_ok() {
            task.command = format!("./{task_id}.sh");
        }

        let first_child = self.tasks_dir.join(format!("{task_id}.1.sh"));
        if fs::metadata(&first_child).await.is_ok() {
            let mut i = 1;
            loop {
                let child_id = format!("{task_id}.{i}");
                let mut child = TaskConfig::new(&child_id);
                child.dir = task.dir.clone();
                match Box::pin(self.load_sh(&child_id, &mut child)).await {
                    Ok(()) => {
                        task.steps.push(child);
                        i += 1;
                    }
                    Err(_) => break,
                }
            }
        }

        if !task.command.is_empty() || !task.steps.is_empty() {
            Ok(())
        } else {
            Err(ManagerError::NotFound(task_id.to_string()))
        }
    }

    async fn load_js(&self, task_id: &str, task: &mut TaskConfig) -> Result<(), ManagerError> {
        task.name = task_id.to_string();
        let path = self.tasks_dir.join(format!("{task_id}.js"));
        if fs::metadata(&path).await.is_ok() {
            task.runtime = Runtime::Js;
            Ok(())
        } else {
            Err(ManagerError::NotFound(task_id.to_string()))
        }
    }

    /// Lists every top-level task id with a `.yaml` or `.sh` definition in the tasks directory.
    /// Numbered `.sh` children (`id.1.sh`), dotfiles, and underscore-prefixed files are excluded;
    /// a task with both a `.yaml` and a `.sh` is listed once.
    pub async fn tasks(&self) -> Result<Vec<TaskListItem>, ManagerError> {
        let mut entries = match fs::read_dir(&self.tasks_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                return Err(ManagerError::Io {
                    task_id: String::new(),
                    source: e,
                })
            }
        };

        let mut seen = std::collections::HashSet::new();
        let mut tasks = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(|e| ManagerError::Io {
            task_id: String::new(),
            source: e,
        })? {
            let file_type = match entry.file_type().await {
                Ok(ft) => ft,
                Err(_) => continue,
            };
            if !file_type.is_file() {
                continue;
            }

            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || name.starts_with('_') {
                continue;
            }

            let (stem, ext) = match name.rsplit_once('.') {
                Some((stem, ext)) => (stem, ext),
                None => continue,
            };
            if ext != "yaml" && ext != "sh" {
                continue;
            }

            let task_id = if ext == "sh" {
                stem.split_once('.').map(|(id, _)| id).unwrap_or(stem)
            } else {
                stem
            };

            if seen.insert(task_id.to_string()) {
                tasks.push(TaskListItem {
                    task_id: task_id.to_string(),
                });
            }
        }

        debug!(count = tasks.len(), "listed tasks");
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn loads_yaml_task_and_fixes_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "build.yaml",
            "name: build\nsequential: true\nsteps:\n  - name: compile\n  - name: link\n",
        );

        let manager = Manager::new(dir.path());
        let task = manager.load("build").await.unwrap();

        assert_eq!(task.task_id, "build");
        assert_eq!(task.steps.len(), 2);
        assert!(task.steps[0].depends.is_empty());
        assert_eq!(task.steps[1].depends, vec!["compile".to_string()]);
    }

    #[tokio::test]
    async fn yaml_without_a_name_falls_back_to_the_task_id() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "deploy.yaml", "command: echo hi\n");

        let manager = Manager::new(dir.path());
        let task = manager.load("deploy").await.unwrap();

        assert_eq!(task.name, "deploy");
    }

    #[tokio::test]
    async fn yaml_specified_dir_overrides_the_tasks_dir_default() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "deploy.yaml", "command: echo hi\ndir: /srv/app\n");

        let manager = Manager::new(dir.path());
        let task = manager.load("deploy").await.unwrap();

        assert_eq!(task.dir, "/srv/app");
    }

    #[tokio::test]
    async fn falls_back_to_sh_when_yaml_missing() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "ping.sh", "#!/bin/sh\necho pong\n");

        let manager = Manager::new(dir.path());
        let task = manager.load("ping").await.unwrap();

        assert_eq!(task.command, "./ping.sh");
        assert!(task.sequential);
    }

    #[tokio::test]
    async fn assembles_numbered_sh_children_as_sequential_steps() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "deploy.1.sh", "#!/bin/sh\necho one\n");
        write_file(dir.path(), "deploy.2.sh", "#!/bin/sh\necho two\n");

        let manager = Manager::new(dir.path());
        let task = manager.load("deploy").await.unwrap();

        assert_eq!(task.steps.len(), 2);
        assert_eq!(task.steps[0].command, "./deploy.1.sh");
        assert_eq!(task.steps[1].depends, vec!["deploy.1".to_string()]);
    }

    #[tokio::test]
    async fn falls_back_to_js_when_no_yaml_or_sh() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "webhook.js", "exports.handler = () => {}\n");

        let manager = Manager::new(dir.path());
        let task = manager.load("webhook").await.unwrap();

        assert_eq!(task.runtime, Runtime::Js);
        assert_eq!(task.command, "./webhook.js");
    }

    #[tokio::test]
    async fn load_reports_not_found_for_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(dir.path());
        let err = manager.load("missing").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound(_)));
    }

    #[tokio::test]
    async fn tasks_lists_unique_top_level_ids() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "build.yaml", "name: build\n");
        write_file(dir.path(), "ping.sh", "#!/bin/sh\n");
        write_file(dir.path(), "ping.1.sh", "#!/bin/sh\n");
        write_file(dir.path(), ".hidden.yaml", "name: hidden\n");

        let manager = Manager::new(dir.path());
        let mut ids: Vec<_> = manager
            .tasks()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        ids.sort();

        assert_eq!(ids, vec!["build".to_string(), "ping".to_string()]);
    }
}
