use crate::e2e::*;

#[test]
fn empty_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("kiln.json", r#"{"tasks": [{"name": "build"}]}"#)?;
    let out = space.run_expect(&mut kiln_command(vec![]))?;
    assert_eq!(std::str::from_utf8(&out.stdout)?, "kiln: no work to do\n");
    Ok(())
}

#[test]
fn missing_task_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let out = space.run(&mut kiln_command(vec![]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "kiln: error: read kiln.json");
    Ok(())
}

#[test]
fn copy_static_files() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("kiln.json", STATIC_TASKS)?;
    space.write("src_static/a.txt", "a")?;
    space.write("src_static/img/b.txt", "b")?;

    let out = space.run_expect(&mut kiln_command(vec![]))?;
    assert_output_contains(&out, "kiln: ran 2 tasks, now up to date");
    assert_eq!(space.read("build/a.txt")?, b"a");
    assert_eq!(space.read("build/img/b.txt")?, b"b");

    let out = space.run_expect(&mut kiln_command(vec![]))?;
    assert_output_contains(&out, "kiln: no work to do");

    space.write("src_static/a.txt", "A")?;
    space.set_mtime("src_static/a.txt", 2_000_000_000)?;
    let out = space.run_expect(&mut kiln_command(vec!["build"]))?;
    assert_output_contains(&out, ".  static:build/a.txt");
    assert_output_not_contains(&out, "static:build/img/b.txt");
    assert_output_contains(&out, "kiln: ran 1 tasks, now up to date");
    assert_eq!(space.read("build/a.txt")?, b"A");
    Ok(())
}

#[cfg(unix)]
#[test]
fn shell_command_output() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "kiln.json",
        r#"{"tasks": [
             {"name": "hello", "targets": ["out/hello.txt"],
              "actions": ["echo hi > out/hello.txt", "echo said hi"]}
           ]}"#,
    )?;
    let out = space.run_expect(&mut kiln_command(vec!["-j", "1", "build", "hello"]))?;
    assert_output_contains(&out, ".  hello\nsaid hi\n");
    assert_eq!(space.read("out/hello.txt")?, b"hi\n");
    Ok(())
}

#[test]
fn chdir_and_file_flags() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("site/tasks.json", STATIC_TASKS)?;
    space.write("site/src_static/a.txt", "a")?;
    let out = space.run_expect(&mut kiln_command(vec!["-C", "site", "-f", "tasks.json"]))?;
    assert_output_contains(&out, "kiln: ran 1 tasks, now up to date");
    assert!(space.exists("site/build/a.txt"));
    assert!(space.exists("site/.kiln_db"));
    Ok(())
}

#[test]
fn list_tasks() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("kiln.json", STATIC_TASKS)?;
    let out = space.run_expect(&mut kiln_command(vec!["list"]))?;
    assert_eq!(
        std::str::from_utf8(&out.stdout)?,
        "build   Build everything\nstatic  Copy static files\n"
    );
    Ok(())
}

#[test]
fn bad_parallelism() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("kiln.json", STATIC_TASKS)?;
    let out = space.run(kiln_command(vec![]).env("KILN_NUM_PROCESS", "0"))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "kiln: error: $KILN_NUM_PROCESS");
    Ok(())
}
