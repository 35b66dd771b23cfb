//! Support code for e2e tests, which run kiln as a binary.

mod basic;
mod clean;
mod failure;

pub fn kiln_command(args: Vec<&str>) -> std::process::Command {
    let mut cmd = std::process::Command::new(env!("CARGO_BIN_EXE_kiln"));
    cmd.args(args);
    // Keep the environment from changing test behavior.
    cmd.env_remove("KILN_NUM_PROCESS");
    cmd.env_remove("KILN_LOG");
    cmd
}

fn print_output(out: &std::process::Output) {
    // Use print! rather than writing to stdout so the test framework
    // captures it.
    print!("{}", String::from_utf8_lossy(&out.stdout));
    print!("{}", String::from_utf8_lossy(&out.stderr));
}

pub fn assert_output_contains(out: &std::process::Output, text: &str) {
    let out = std::str::from_utf8(&out.stdout).unwrap();
    if !out.contains(text) {
        panic!(
            "assertion failed; expected output to contain {:?} but got:\n{}",
            text, out
        );
    }
}

pub fn assert_output_not_contains(out: &std::process::Output, text: &str) {
    let out = std::str::from_utf8(&out.stdout).unwrap();
    if out.contains(text) {
        panic!(
            "assertion failed; expected output to not contain {:?} but got:\n{}",
            text, out
        );
    }
}

/// Manages a temporary directory for invoking kiln.
pub struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        Ok(TestSpace { dir })
    }

    /// Write a file into the working space, creating parent directories.
    pub fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        let path = self.dir.path().join(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
    }

    /// Read a file from the working space.
    pub fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.dir.path().join(path))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.dir.path().join(path).exists()
    }

    /// Set a file's mtime, in seconds since the epoch.
    pub fn set_mtime(&self, path: &str, secs: i64) -> std::io::Result<()> {
        filetime::set_file_mtime(
            self.dir.path().join(path),
            filetime::FileTime::from_unix_time(secs, 0),
        )
    }

    /// Invoke kiln, returning process output.
    pub fn run(&self, cmd: &mut std::process::Command) -> std::io::Result<std::process::Output> {
        cmd.current_dir(self.dir.path()).output()
    }

    /// Like run, but also print output if the build failed.
    pub fn run_expect(
        &self,
        cmd: &mut std::process::Command,
    ) -> anyhow::Result<std::process::Output> {
        let out = self.run(cmd)?;
        if !out.status.success() {
            print_output(&out);
            anyhow::bail!("build failed, status {}", out.status);
        }
        Ok(out)
    }

    /// Persist the temp dir locally and abort the test.  Debugging helper.
    #[allow(dead_code)]
    pub fn eject(self) -> ! {
        panic!("ejected at {:?}", self.dir.into_path());
    }
}

/// Copies every file under src_static/ into build/.
pub const STATIC_TASKS: &str = r#"{
  "default": ["build"],
  "tasks": [
    {"name": "build", "doc": "Build everything", "task_dep": ["static"]},
    {"name": "static", "doc": "Copy static files",
     "actions": [{"copy": ["{src}", "{target}"]}],
     "foreach": {"glob": "src_static/**/*", "base": "src_static",
                 "target": "build/{rel}"}}
  ]
}"#;
