//! Stage-in / stage-out round trips against a live silo.

use ironsilo::config::{ClusterConfig, StagingPaths};
use ironsilo::harness::Silo;
use ironsilo::stage::{stage_in, stage_out, staged_inputs};
use ironsilo::testing::*;

#[test]
fn round_trip_moves_results_out_of_the_namespace() -> anyhow::Result<()> {
    let base = scratch_base()?;
    let local = scratch_base()?;
    let input = local.path().join("people.csv");
    write_lines(&input, &sample_census_lines())?;

    let silo = Silo::provision(ClusterConfig::new(base.path()))?;
    let staging = StagingPaths::for_job("peopleinyear");

    let report = stage_in(&silo, std::slice::from_ref(&input), &staging)?;
    assert_eq!(report.files, 1);
    assert_eq!(report.bytes, std::fs::metadata(&input)?.len());
    assert!(silo.fs().exists("peopleinyear/input/people.csv"));

    let staged = staged_inputs(&silo, &staging)?;
    assert_eq!(staged.len(), 1);
    assert!(staged[0].ends_with("people.csv"));

    // Stand in for a job run: drop a part file into the staged output dir.
    std::fs::write(
        silo.fs().resolve("peopleinyear/output/part-r-00000")?,
        "1950\t2\n",
    )?;

    let dest = local.path().join("out");
    let moved = stage_out(&silo, &staging, &dest)?;
    assert_eq!(moved, vec![dest.join("part-r-00000")]);
    assert_eq!(std::fs::read_to_string(&moved[0])?, "1950\t2\n");

    // Move semantics: nothing is left behind in the namespace.
    assert!(silo.fs().list_files("peopleinyear/output")?.is_empty());

    silo.release()?;
    Ok(())
}

#[test]
fn restaging_clears_previous_run_state() -> anyhow::Result<()> {
    let base = scratch_base()?;
    let local = scratch_base()?;
    let first = local.path().join("first.csv");
    let second = local.path().join("second.csv");
    write_lines(&first, &sample_census_lines())?;
    write_lines(&second, &sample_census_lines())?;

    let silo = Silo::provision(ClusterConfig::new(base.path()))?;
    let staging = StagingPaths::for_job("peopleinyear");

    stage_in(&silo, std::slice::from_ref(&first), &staging)?;
    // Leftover output from an imagined earlier run.
    std::fs::write(silo.fs().resolve("peopleinyear/output/part-r-00000")?, "stale\n")?;

    stage_in(&silo, std::slice::from_ref(&second), &staging)?;

    let staged = silo.fs().list_files("peopleinyear/input")?;
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].name, "second.csv");
    assert!(silo.fs().list_files("peopleinyear/output")?.is_empty());

    silo.release()?;
    Ok(())
}

#[test]
fn directory_inputs_stage_recursively() -> anyhow::Result<()> {
    let base = scratch_base()?;
    let local = scratch_base()?;
    let corpus = local.path().join("corpus");
    std::fs::create_dir_all(corpus.join("older"))?;
    write_lines(&corpus.join("recent.csv"), &sample_census_lines())?;
    write_lines(
        &corpus.join("older/archive.csv"),
        &[census_header(), census_row("EVA", &[(1980, 1)])],
    )?;

    let silo = Silo::provision(ClusterConfig::new(base.path()))?;
    let staging = StagingPaths::for_job("peopleinyear");

    let report = stage_in(&silo, std::slice::from_ref(&corpus), &staging)?;
    assert_eq!(report.files, 2);
    assert!(silo.fs().exists("peopleinyear/input/corpus/recent.csv"));
    assert!(silo.fs().exists("peopleinyear/input/corpus/older/archive.csv"));

    silo.release()?;
    Ok(())
}

#[test]
fn stage_out_clears_stale_local_results() -> anyhow::Result<()> {
    let base = scratch_base()?;
    let local = scratch_base()?;
    let input = local.path().join("people.csv");
    write_lines(&input, &sample_census_lines())?;

    let silo = Silo::provision(ClusterConfig::new(base.path()))?;
    let staging = StagingPaths::for_job("peopleinyear");
    stage_in(&silo, std::slice::from_ref(&input), &staging)?;
    std::fs::write(
        silo.fs().resolve("peopleinyear/output/part-r-00000")?,
        "1950\t2\n",
    )?;

    // Destination already holds results from some earlier run.
    let dest = local.path().join("out");
    std::fs::create_dir_all(&dest)?;
    std::fs::write(dest.join("part-r-00099"), "stale\n")?;

    let moved = stage_out(&silo, &staging, &dest)?;
    assert_eq!(moved, vec![dest.join("part-r-00000")]);
    assert!(!dest.join("part-r-00099").exists());

    silo.release()?;
    Ok(())
}

#[test]
fn staged_inputs_come_back_sorted_with_summed_bytes() -> anyhow::Result<()> {
    let base = scratch_base()?;
    let local = scratch_base()?;
    let zebra = local.path().join("zebra.csv");
    let aard = local.path().join("aardvark.csv");
    write_lines(&zebra, &sample_census_lines())?;
    write_lines(&aard, &[census_header(), census_row("EVA", &[(1980, 1)])])?;

    let silo = Silo::provision(ClusterConfig::new(base.path()))?;
    let staging = StagingPaths::for_job("peopleinyear");

    let report = stage_in(&silo, &[zebra.clone(), aard.clone()], &staging)?;
    assert_eq!(report.files, 2);
    assert_eq!(
        report.bytes,
        std::fs::metadata(&zebra)?.len() + std::fs::metadata(&aard)?.len()
    );

    let staged = staged_inputs(&silo, &staging)?;
    let names: Vec<_> = staged
        .iter()
        .filter_map(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["aardvark.csv", "zebra.csv"]);

    silo.release()?;
    Ok(())
}
