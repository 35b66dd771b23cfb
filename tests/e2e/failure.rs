use crate::e2e::*;

#[cfg(unix)]
#[test]
fn failed_task_skips_dependents() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "kiln.json",
        r#"{"tasks": [
             {"name": "build", "task_dep": ["feed", "other"]},
             {"name": "pages", "actions": ["echo rendering; exit 3"]},
             {"name": "feed", "task_dep": ["pages"], "targets": ["feed.xml"],
              "actions": ["touch feed.xml"]},
             {"name": "other", "targets": ["other.txt"], "actions": ["touch other.txt"]}
           ]}"#,
    )?;
    let out = space.run(&mut kiln_command(vec![]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "failed: pages\nrendering\n");
    assert_output_contains(&out, "exit status: 3");
    assert_output_contains(&out, "kiln: 1 tasks failed");
    assert!(!space.exists("feed.xml"));
    assert!(space.exists("other.txt"));

    // The failure is retried; the independent task is not.
    let out = space.run(&mut kiln_command(vec!["-v"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "skipped: feed");
    assert_output_contains(&out, "-- other");
    assert_output_not_contains(&out, ".  other");
    Ok(())
}

#[test]
fn dependency_cycle() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "kiln.json",
        r#"{"tasks": [
             {"name": "a", "task_dep": ["b"]},
             {"name": "b", "task_dep": ["a"]}
           ]}"#,
    )?;
    let out = space.run(&mut kiln_command(vec!["build", "a"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "kiln: error: dependency cycle: ");
    Ok(())
}

#[test]
fn unknown_task() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("kiln.json", STATIC_TASKS)?;
    let out = space.run(&mut kiln_command(vec!["build", "nope"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "kiln: error: unknown task \"nope\"");
    Ok(())
}

#[test]
fn duplicate_task() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "kiln.json",
        r#"{"tasks": [{"name": "a"}, {"name": "a"}]}"#,
    )?;
    let out = space.run(&mut kiln_command(vec![]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "kiln: error: duplicate task \"a\"");
    Ok(())
}
