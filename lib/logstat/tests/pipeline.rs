use logstat::jobs::country::country_pipeline;
use logstat::jobs::session_length::{session_length_pipeline, SESSION_LENGTH_STAGE, SESSION_TIME_STAGE};
use logstat::pipeline::Dataset;
use logstat::{LogValidation, ResultRow, RuntimeSettings, StageEnv, StageOptions};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

fn env(root: &Path, legacy: bool) -> StageEnv {
    StageEnv {
        settings: RuntimeSettings { num_reducers: 3, map_tasks: 2, work_dir: root.join("work"), ..Default::default() },
        options: StageOptions { counting: true, legacy_partitioner: legacy, ..Default::default() },
    }
}

fn rows(dir: &Path) -> Vec<String> {
    let mut lines: Vec<String> = Dataset::part_files(dir)
        .unwrap()
        .into_iter()
        .flat_map(|p| fs::read_to_string(p).unwrap().lines().map(str::to_string).collect::<Vec<_>>())
        .collect();
    lines.sort();
    lines
}

fn event(cmd: &str, appkey: &str, session: &str, token: &str, secs: u32, country: &str) -> String {
    format!(
        "{}\t{}\t{}\t{}\t20140301{:02}{:02}{:02}\t{}\n",
        cmd,
        appkey,
        session,
        token,
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        country
    )
}

#[test]
fn country_distribution_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let logs = dir.path().join("logs");
    fs::create_dir_all(logs.join("2014/03/01")).unwrap();

    let mut first = String::new();
    for t in [10, 20, 30] {
        first.push_str(&event("PAGEVIEW", "A", "s1", "t1", t, "PH"));
    }
    first.push_str("this line is garbage\n");
    let mut second = String::new();
    second.push_str(&event("STARTSESS", "A", "s2", "t1", 100, "PH"));
    second.push_str(&event("ENDSESS", "A", "s2", "t1", 200, "PH"));
    second.push_str(&event("STARTSESS", "B", "s7", "t9", 5, ""));
    second.push_str("COMPONENT\tB\ts8\tt9\t20140301000010\tKR\tmenu\n");
    second.push_str("NOPE\tB\ts8\tt9\t20140301000010\tKR\n");
    fs::write(logs.join("2014/03/01/a.log"), first).unwrap();
    fs::write(logs.join("2014/03/01/b.log"), second).unwrap();
    fs::write(logs.join("_SUCCESS"), "").unwrap();

    let output = dir.path().join("country");
    let report = country_pipeline(Dataset::at(&logs), &output, env(dir.path(), false)).run().unwrap();

    assert_eq!(rows(&output), vec!["A|PH\t1|2", "B|--\t1|1", "B|KR\t1|1"]);
    let stage = &report.stages[0];
    assert_eq!(stage.validation.get(LogValidation::Malformed), 1);
    assert_eq!(stage.validation.get(LogValidation::Invalid), 1);
    assert_eq!(stage.validation.get(LogValidation::Degraded), 1);
    assert_eq!(stage.validation.get(LogValidation::Valid), 6);
    assert_eq!(stage.map.total_emits, 7);
    assert_eq!(stage.reduce.total_rows, 3);
}

#[test]
fn legacy_partitioner_gives_the_same_rows() {
    let dir = tempfile::tempdir().unwrap();
    let logs = dir.path().join("in.log");
    let mut text = String::new();
    for (i, app) in ["A", "B", "C", "D", "E"].iter().enumerate() {
        for s in 0..4u32 {
            text.push_str(&event("PAGEVIEW", app, &format!("s{}", s), &format!("t{}", s % 2), i as u32 + s, "PH"));
        }
    }
    fs::write(&logs, text).unwrap();

    let stable = dir.path().join("stable");
    let legacy = dir.path().join("legacy");
    country_pipeline(Dataset::at(&logs), &stable, env(dir.path(), false)).run().unwrap();
    country_pipeline(Dataset::at(&logs), &legacy, env(dir.path(), true)).run().unwrap();
    assert_eq!(rows(&stable), rows(&legacy));
    assert_eq!(rows(&stable).len(), 5);
}

#[test]
fn session_length_histogram_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let logs = dir.path().join("logs");
    fs::create_dir_all(&logs).unwrap();

    // (appkey, session, event offsets in seconds)
    let sessions: Vec<(&str, String, Vec<u32>)> = (0..40u32)
        .map(|i| {
            let app = if i % 3 == 0 { "A" } else { "B" };
            let start = i * 50;
            let offsets = match i % 4 {
                0 => vec![start],
                1 => vec![start, start + 30],
                2 => vec![start + 60, start, start + 30],
                _ => vec![start, start, start + 90, start + 30],
            };
            (app, format!("s{}", i), offsets)
        })
        .collect();

    let mut expected_sessions: BTreeMap<&str, u64> = BTreeMap::new();
    for (file_idx, chunk) in sessions.chunks(7).enumerate() {
        let mut text = String::new();
        for (app, session, offsets) in chunk {
            for &t in offsets {
                text.push_str(&event("PAGEVIEW", app, session, "tok", t, "PH"));
            }
            let span = offsets.iter().max().unwrap() - offsets.iter().min().unwrap();
            if span > 0 {
                *expected_sessions.entry(*app).or_default() += 1;
            }
        }
        text.push_str("broken line\n");
        fs::write(logs.join(format!("part-{}.log", file_idx)), text).unwrap();
    }

    let intermediate = dir.path().join("sesstime");
    let output = dir.path().join("sessionlength");
    let report = session_length_pipeline(Dataset::at(&logs), &intermediate, &output, env(dir.path(), false))
        .run()
        .unwrap();

    assert!(Dataset::is_complete(&intermediate));
    assert!(Dataset::is_complete(&output));
    assert_eq!(rows(&intermediate).len() as u64, expected_sessions.values().sum::<u64>());

    let mut histogram_total: BTreeMap<String, u64> = BTreeMap::new();
    for line in rows(&output) {
        let row = ResultRow::parse(&line, "|").unwrap();
        assert!(row.key[1].parse::<i64>().unwrap() > 0);
        *histogram_total.entry(row.key[0].clone()).or_default() += row.value[0].parse::<u64>().unwrap();
    }
    let expected: BTreeMap<String, u64> = expected_sessions.iter().map(|(k, v)| (k.to_string(), *v)).collect();
    assert_eq!(histogram_total, expected);

    let first = report.stage(SESSION_TIME_STAGE).unwrap();
    assert_eq!(first.validation.get(LogValidation::Malformed), 6);
    assert_eq!(first.reduce.dropped_groups, 10);
    let second = report.stage(SESSION_LENGTH_STAGE).unwrap();
    assert_eq!(second.validation.get(LogValidation::Valid), 30);
    assert!(second.map.total_spilled <= second.map.total_emits);
}

#[test]
fn two_sessions_of_one_hundred_seconds() {
    let dir = tempfile::tempdir().unwrap();
    let logs = dir.path().join("in.log");
    let mut text = String::new();
    for t in [100, 150, 200] {
        text.push_str(&event("PAGEVIEW", "A", "s1", "t1", t, "PH"));
    }
    for t in [300, 400] {
        text.push_str(&event("PAGEVIEW", "A", "s2", "t1", t, "PH"));
    }
    fs::write(&logs, text).unwrap();

    let intermediate = dir.path().join("tmp");
    let output = dir.path().join("out");
    session_length_pipeline(Dataset::at(&logs), &intermediate, &output, env(dir.path(), true)).run().unwrap();
    assert_eq!(rows(&intermediate), vec!["A|s1\t100", "A|s2\t100"]);
    assert_eq!(rows(&output), vec!["A|100\t2"]);
}

#[test]
fn undecodable_line_is_skipped_as_malformed() {
    let dir = tempfile::tempdir().unwrap();
    let logs = dir.path().join("in.log");
    let mut bytes = event("PAGEVIEW", "A", "s1", "t1", 10, "PH").into_bytes();
    bytes.extend_from_slice(b"PAGEVIEW\tA\ts1\t\xff\xfe\t20140301000020\tPH\n");
    bytes.extend_from_slice(event("PAGEVIEW", "A", "s2", "t2", 30, "PH").as_bytes());
    fs::write(&logs, bytes).unwrap();

    let output = dir.path().join("country");
    let report = country_pipeline(Dataset::at(&logs), &output, env(dir.path(), false)).run().unwrap();

    assert_eq!(rows(&output), vec!["A|PH\t2|2"]);
    let stage = &report.stages[0];
    assert_eq!(stage.validation.get(LogValidation::Malformed), 1);
    assert_eq!(stage.validation.get(LogValidation::Valid), 2);
}

#[test]
fn sessions_with_separator_in_their_id_are_rejected_up_front() {
    let dir = tempfile::tempdir().unwrap();
    let logs = dir.path().join("in.log");
    let mut text = String::new();
    for t in [0, 60] {
        text.push_str(&event("PAGEVIEW", "A", "s|1", "t1", t, "PH"));
        text.push_str(&event("PAGEVIEW", "A", "s2", "t1", t, "PH"));
    }
    fs::write(&logs, text).unwrap();

    let intermediate = dir.path().join("tmp");
    let output = dir.path().join("out");
    let report = session_length_pipeline(Dataset::at(&logs), &intermediate, &output, env(dir.path(), false))
        .run()
        .unwrap();

    assert_eq!(rows(&intermediate), vec!["A|s2\t60"]);
    assert_eq!(rows(&output), vec!["A|60\t1"]);
    let first = report.stage(SESSION_TIME_STAGE).unwrap();
    assert_eq!(first.validation.get(LogValidation::Invalid), 2);
    let second = report.stage(SESSION_LENGTH_STAGE).unwrap();
    assert_eq!(second.validation.get(LogValidation::Malformed), 0);
    assert_eq!(second.validation.get(LogValidation::Valid), 1);
}

#[test]
fn missing_input_fails_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let result = session_length_pipeline(
        Dataset::at(dir.path().join("nowhere")),
        dir.path().join("tmp"),
        dir.path().join("out"),
        env(dir.path(), false),
    )
    .run();
    let err = result.unwrap_err();
    assert!(format!("{:#}", err).contains(SESSION_TIME_STAGE));
    assert!(!Dataset::is_complete(&dir.path().join("out")));
}
