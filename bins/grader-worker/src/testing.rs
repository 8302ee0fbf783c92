// Test fakes shared by the worker's unit tests

use crate::engine::{ContainerRuntime, ContainerSpec, SandboxError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Build an in-memory zip; `None` content marks a directory entry
pub fn build_zip(entries: &[(&str, Option<&str>)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();

    for (name, content) in entries {
        match content {
            Some(content) => {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
            None => {
                writer.add_directory(name.trim_end_matches('/'), options).unwrap();
            }
        }
    }

    writer.finish().unwrap().into_inner()
}

/// Minimal Maven project archive
pub fn project_zip() -> Vec<u8> {
    build_zip(&[
        ("pom.xml", Some("<project/>")),
        ("src/main/java/com/challenge/", None),
        ("src/main/java/com/challenge/Cart.java", Some("package com.challenge; class Cart {}")),
    ])
}

/// Surefire-style report; `(test name, Some(failure))` marks a failure
pub fn surefire_report(class_name: &str, cases: &[(&str, Option<&str>)]) -> String {
    let mut xml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<testsuite name=\"{}\" tests=\"{}\">\n",
        class_name,
        cases.len()
    );
    for (name, failure) in cases {
        match failure {
            Some(message) => xml.push_str(&format!(
                "  <testcase name=\"{}\" classname=\"{}\" time=\"0.010\"><failure message=\"{}\">{}</failure></testcase>\n",
                name, class_name, message, message
            )),
            None => xml.push_str(&format!(
                "  <testcase name=\"{}\" classname=\"{}\" time=\"0.010\"/>\n",
                name, class_name
            )),
        }
    }
    xml.push_str("</testsuite>\n");
    xml
}

/// Checkstyle-style report with `count` violations in one file
pub fn checkstyle_report(count: usize) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<checkstyle version=\"10.12.5\">\n  <file name=\"/workspace/src/main/java/com/challenge/Cart.java\">\n",
    );
    for line in 0..count {
        xml.push_str(&format!(
            "    <error line=\"{}\" severity=\"warning\" message=\"'42' is a magic number.\" source=\"com.puppycrawl.tools.checkstyle.checks.coding.MagicNumberCheck\"/>\n",
            line + 1
        ));
    }
    xml.push_str("  </file>\n</checkstyle>\n");
    xml
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeCall {
    Pull,
    Create,
    Start(String),
    Wait(String),
    Logs(String),
    Remove(String),
}

#[derive(Default)]
struct FakeState {
    calls: Vec<RuntimeCall>,
    specs: HashMap<String, ContainerSpec>,
    live: HashSet<String>,
    last_spec: Option<ContainerSpec>,
    next_id: usize,
}

/// Scriptable container runtime
///
/// On start it writes the configured report files into the workspace
/// bound at the container's first bind, as the real build would.
pub struct FakeRuntime {
    exit_code: i64,
    output: String,
    hang: Option<Duration>,
    image_missing: bool,
    fail_pull: bool,
    fail_create: bool,
    fail_start: bool,
    fail_wait: bool,
    files: Vec<(String, String)>,
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            exit_code: 0,
            output: String::new(),
            hang: None,
            image_missing: false,
            fail_pull: false,
            fail_create: false,
            fail_start: false,
            fail_wait: false,
            files: Vec::new(),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn exit_code(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    pub fn output(mut self, output: &str) -> Self {
        self.output = output.to_string();
        self
    }

    /// Make wait_container block for `duration` before returning
    pub fn hang_for(mut self, duration: Duration) -> Self {
        self.hang = Some(duration);
        self
    }

    pub fn image_missing(mut self) -> Self {
        self.image_missing = true;
        self
    }

    pub fn fail_pull(mut self) -> Self {
        self.fail_pull = true;
        self
    }

    pub fn fail_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn fail_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn fail_wait(mut self) -> Self {
        self.fail_wait = true;
        self
    }

    /// File written into the workspace when the container starts
    pub fn with_file(mut self, relative_path: &str, content: &str) -> Self {
        self.files.push((relative_path.to_string(), content.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn live_containers(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn last_spec(&self) -> Option<ContainerSpec> {
        self.state.lock().unwrap().last_spec.clone()
    }

    fn record(&self, call: RuntimeCall) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn workspace_of(&self, id: &str) -> Option<PathBuf> {
        let state = self.state.lock().unwrap();
        let bind = state.specs.get(id)?.binds.first()?.clone();
        bind.split(':').next().map(PathBuf::from)
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn image_present(&self, _image: &str) -> bool {
        !self.image_missing
    }

    async fn pull_image(&self, image: &str) -> Result<(), SandboxError> {
        self.record(RuntimeCall::Pull);
        if self.fail_pull {
            return Err(SandboxError::Pull {
                image: image.to_string(),
                reason: "registry unreachable".to_string(),
            });
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RuntimeCall::Create);
        state.last_spec = Some(spec.clone());
        if self.fail_create {
            return Err(SandboxError::Create("no such image".to_string()));
        }
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.specs.insert(id.clone(), spec.clone());
        state.live.insert(id.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), SandboxError> {
        self.record(RuntimeCall::Start(id.to_string()));
        if self.fail_start {
            return Err(SandboxError::Start("OCI runtime error".to_string()));
        }
        if let Some(workspace) = self.workspace_of(id) {
            for (relative, content) in &self.files {
                let path = workspace.join(relative);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).unwrap();
                }
                std::fs::write(path, content).unwrap();
            }
        }
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, SandboxError> {
        self.record(RuntimeCall::Wait(id.to_string()));
        if let Some(hang) = self.hang {
            tokio::time::sleep(hang).await;
        }
        if self.fail_wait {
            return Err(SandboxError::Wait("connection reset".to_string()));
        }
        Ok(self.exit_code)
    }

    async fn container_output(&self, id: &str) -> Result<String, SandboxError> {
        self.record(RuntimeCall::Logs(id.to_string()));
        Ok(self.output.clone())
    }

    async fn remove_container(&self, id: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RuntimeCall::Remove(id.to_string()));
        state.live.remove(id);
        Ok(())
    }
}
