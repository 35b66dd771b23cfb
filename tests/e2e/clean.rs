use crate::e2e::*;

#[test]
fn clean_then_rebuild() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("kiln.json", STATIC_TASKS)?;
    space.write("src_static/a.txt", "a")?;
    space.write("src_static/b.txt", "b")?;
    space.run_expect(&mut kiln_command(vec![]))?;

    let out = space.run_expect(&mut kiln_command(vec!["-v", "clean", "static"]))?;
    assert_output_contains(&out, "removed build/a.txt");
    assert_output_contains(&out, "kiln: cleaned 2 files");
    assert!(!space.exists("build/a.txt"));
    assert!(space.exists("src_static/a.txt"));

    let out = space.run_expect(&mut kiln_command(vec![]))?;
    assert_output_contains(&out, "kiln: ran 2 tasks, now up to date");
    Ok(())
}

#[test]
fn clean_nothing_built() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("kiln.json", STATIC_TASKS)?;
    space.write("src_static/a.txt", "a")?;
    let out = space.run_expect(&mut kiln_command(vec!["clean"]))?;
    assert_output_contains(&out, "kiln: cleaned 0 files");
    Ok(())
}
