//! End-to-end rebuilds against in-memory collection archives

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use orcrebuild_core::audit::read_csv;
use orcrebuild_core::{
    MemoryArchive, MemoryContainer, ReasonCode, RebuildConfig, RebuildError, Rebuilder,
    NON_EXTRACTED_REPORT,
};
use tempfile::TempDir;

const GETTHIS_HEADER: &str = "ComputerName,VolumeID,ParentFRN,FRN,FullName,SampleName,SizeInBytes,MD5,SHA1,FindMatch,ContentType,SampleCollectionDate,CreationDate,LastModificationDate,LastAccessDate,LastAttrChangeDate,FileNameCreationDate,FileNameLastModificationDate,FileNameLastAccessDate,FileNameLastAttrModificationDate,AttrType,AttrName,AttrID,SnapshotID\n";
const LIVE: &str = "{00000000-0000-0000-0000-000000000000}";

fn getthis_row(volume: &str, full_name: &str, sample: &str, snapshot: &str) -> String {
    format!(
        "HOST,{volume},0x1,0x2,{full_name},{sample},4,,,Name,data,,,,,,,,,,$DATA,,0,{snapshot}\n"
    )
}

fn getthis(rows: &[String]) -> String {
    let mut text = GETTHIS_HEADER.to_string();
    for row in rows {
        text.push_str(row);
    }
    text
}

fn volstats() -> &'static str {
    "ComputerName,VolumeID,MountPoint,FileSystem,Size\nHOST,{V1},C:\\,NTFS,100\nHOST,{V2},D:\\,NTFS,100\n"
}

/// Every file below `root` (audit file excluded) with its contents
fn tree(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let relative = path.strip_prefix(root).unwrap().to_path_buf();
                if relative != Path::new(NON_EXTRACTED_REPORT) {
                    out.insert(relative, fs::read(&path).unwrap());
                }
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

fn scenario_a(with_volstats: bool) -> MemoryArchive {
    let mut general = MemoryContainer::new()
        .with_file(
            "GetThis.csv",
            getthis(&[getthis_row(
                "{V1}",
                "C:\\Users\\test\\file.txt",
                "Sample\\file.txt_data",
                LIVE,
            )]),
        )
        .with_file("Sample/file.txt_data", "ABCD");
    if with_volstats {
        general = general.with_file("volstats.csv", volstats());
    }
    MemoryArchive::new(MemoryContainer::new().with_container("General.7z", general))
}

#[test]
fn test_scenario_a_volume_mapped_to_drive_letter() {
    let temp_dir = TempDir::new().unwrap();
    let mut rebuilder = Rebuilder::new(scenario_a(true), RebuildConfig::default());
    let report = rebuilder.run(temp_dir.path()).unwrap();

    let expected = temp_dir
        .path()
        .join("C")
        .join("Users")
        .join("test")
        .join("file.txt");
    assert_eq!(fs::read(expected).unwrap(), b"ABCD");
    assert_eq!(report.extraction.files_written, 1);
    assert_eq!(report.audit.total_records, 0);
    assert!(temp_dir.path().join(NON_EXTRACTED_REPORT).exists());
}

#[test]
fn test_scenario_b_missing_volstats_uses_identifier() {
    let temp_dir = TempDir::new().unwrap();
    let mut rebuilder = Rebuilder::new(scenario_a(false), RebuildConfig::default());
    rebuilder.run(temp_dir.path()).unwrap();

    let expected = temp_dir
        .path()
        .join("{V1}")
        .join("Users")
        .join("test")
        .join("file.txt");
    assert_eq!(fs::read(expected).unwrap(), b"ABCD");
}

#[test]
fn test_keep_volume_ids_ignores_volstats() {
    let temp_dir = TempDir::new().unwrap();
    let config = RebuildConfig {
        rename_volumes: false,
        ..Default::default()
    };
    Rebuilder::new(scenario_a(true), config)
        .run(temp_dir.path())
        .unwrap();
    assert!(temp_dir.path().join("{V1}").is_dir());
    assert!(!temp_dir.path().join("C").exists());
}

#[test]
fn test_scenario_c_collector_failure_is_audited() {
    let temp_dir = TempDir::new().unwrap();
    let archive = MemoryArchive::new(MemoryContainer::new().with_container(
        "General.7z",
        MemoryContainer::new()
            .with_file(
                "GetThis.csv",
                getthis(&[getthis_row("{V1}", "C:\\Windows\\big.evtx", "", LIVE)]),
            )
            .with_file("volstats.csv", volstats()),
    ));

    let report = Rebuilder::new(archive, RebuildConfig::default())
        .run(temp_dir.path())
        .unwrap();

    assert_eq!(report.extraction.files_written, 0);
    assert!(tree(temp_dir.path()).is_empty());

    let records = read_csv(&report.audit_file).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, ReasonCode::NotExtractedByCollector);
    assert_eq!(records[0].original_path, "C:\\Windows\\big.evtx");
    assert_eq!(records[0].volume_id, "{V1}");
}

fn scenario_d() -> MemoryArchive {
    MemoryArchive::new(
        MemoryContainer::new()
            .with_container(
                "General.7z",
                MemoryContainer::new()
                    .with_file(
                        "GetThis.csv",
                        getthis(&[getthis_row("{V1}", "C:\\ok.txt", "ok.dat", LIVE)]),
                    )
                    .with_file("ok.dat", "good")
                    .with_file("volstats.csv", volstats()),
            )
            .with_container(
                "Detail.7z",
                MemoryContainer::new()
                    .protected("infected")
                    .with_file(
                        "GetThis.csv",
                        getthis(&[getthis_row("{V1}", "C:\\secret.txt", "s.dat", LIVE)]),
                    )
                    .with_file("s.dat", "hidden"),
            ),
    )
}

#[test]
fn test_scenario_d_protected_container_without_password() {
    let temp_dir = TempDir::new().unwrap();
    let report = Rebuilder::new(scenario_d(), RebuildConfig::default())
        .run(temp_dir.path())
        .unwrap();

    assert_eq!(
        fs::read(temp_dir.path().join("C").join("ok.txt")).unwrap(),
        b"good"
    );
    assert!(!temp_dir.path().join("C").join("secret.txt").exists());

    let records = read_csv(&report.audit_file).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, ReasonCode::ArchiveReadError);
    assert_eq!(records[0].original_path, "./Detail.7z");
    assert_eq!(report.catalog.containers_failed, 1);
}

#[test]
fn test_scenario_d_with_password_extracts_everything() {
    let temp_dir = TempDir::new().unwrap();
    let config = RebuildConfig::default().with_password("Detail.7z", "infected");
    let report = Rebuilder::new(scenario_d(), config)
        .run(temp_dir.path())
        .unwrap();

    assert_eq!(
        fs::read(temp_dir.path().join("C").join("secret.txt")).unwrap(),
        b"hidden"
    );
    assert_eq!(report.audit.total_records, 0);
    assert_eq!(report.catalog.manifests_parsed, 2);
}

#[test]
fn test_wrong_password_is_audited_not_fatal() {
    let temp_dir = TempDir::new().unwrap();
    let config = RebuildConfig::default().with_password("Detail.7z", "wrong");
    let report = Rebuilder::new(scenario_d(), config)
        .run(temp_dir.path())
        .unwrap();
    assert_eq!(report.extraction.files_written, 1);
    assert_eq!(
        report.audit.by_reason.get(&ReasonCode::ArchiveReadError),
        Some(&1)
    );
}

#[test]
fn test_idempotent_across_fresh_roots() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();

    Rebuilder::new(scenario_d(), RebuildConfig::default())
        .run(first.path())
        .unwrap();
    Rebuilder::new(scenario_d(), RebuildConfig::default())
        .run(second.path())
        .unwrap();

    assert_eq!(tree(first.path()), tree(second.path()));
    assert_eq!(
        fs::read_to_string(first.path().join(NON_EXTRACTED_REPORT)).unwrap(),
        fs::read_to_string(second.path().join(NON_EXTRACTED_REPORT)).unwrap()
    );
}

#[test]
fn test_duplicate_original_paths_across_manifests() {
    let temp_dir = TempDir::new().unwrap();
    let manifest = |sample: &str| getthis(&[getthis_row("{V1}", "C:\\dup\\same.log", sample, LIVE)]);
    let archive = MemoryArchive::new(
        MemoryContainer::new()
            .with_container(
                "A.7z",
                MemoryContainer::new()
                    .with_file("GetThis.csv", manifest("a.dat"))
                    .with_file("a.dat", "first")
                    .with_file("volstats.csv", volstats()),
            )
            .with_container(
                "B.7z",
                MemoryContainer::new()
                    .with_file("GetThis.csv", manifest("b.dat"))
                    .with_file("b.dat", "second"),
            ),
    );

    let report = Rebuilder::new(archive, RebuildConfig::default())
        .run(temp_dir.path())
        .unwrap();

    let files = tree(temp_dir.path());
    assert_eq!(files.len(), 2);
    let contents: Vec<&[u8]> = files.values().map(|v| v.as_slice()).collect();
    assert!(contents.contains(&b"first".as_slice()));
    assert!(contents.contains(&b"second".as_slice()));

    let plain = PathBuf::from("C").join("dup").join("same.log");
    assert_eq!(files.get(&plain).map(|v| v.as_slice()), Some(b"first".as_slice()));
    let tagged = files
        .keys()
        .find(|p| **p != plain)
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap()
        .to_string();
    assert!(tagged.starts_with("same ("));
    assert!(tagged.ends_with(").log"));
    assert_eq!(report.extraction.disambiguated, 1);
}

#[test]
fn test_traversal_stays_inside_output_root() {
    let temp_dir = TempDir::new().unwrap();
    let out = temp_dir.path().join("out");
    let archive = MemoryArchive::new(
        MemoryContainer::new()
            .with_file(
                "GetThis.csv",
                getthis(&[getthis_row(
                    "{V1}",
                    "C:\\..\\..\\..\\escape\\..\\..\\evil.txt",
                    "x.dat",
                    LIVE,
                )]),
            )
            .with_file("x.dat", "evil"),
    );

    Rebuilder::new(archive, RebuildConfig::default())
        .run(&out)
        .unwrap();

    let files = tree(&out);
    assert_eq!(files.len(), 1);
    let (relative, _) = files.iter().next().unwrap();
    assert_eq!(relative, &PathBuf::from("{V1}").join("evil.txt"));
    assert!(!temp_dir.path().join("evil.txt").exists());
}

#[test]
fn test_live_and_shadow_copy_roots_are_distinct() {
    let temp_dir = TempDir::new().unwrap();
    let archive = MemoryArchive::new(
        MemoryContainer::new()
            .with_file(
                "GetThis.csv",
                getthis(&[
                    getthis_row("{V1}", "C:\\Windows\\System32\\config\\SAM", "live", LIVE),
                    getthis_row("{V1}", "C:\\Windows\\System32\\config\\SAM", "vsc", "{S1}"),
                ]),
            )
            .with_file("volstats.csv", volstats())
            .with_file("live", "now")
            .with_file("vsc", "then"),
    );

    let report = Rebuilder::new(archive, RebuildConfig::default())
        .run(temp_dir.path())
        .unwrap();

    let sam = |root: &str| {
        temp_dir
            .path()
            .join(root)
            .join("Windows")
            .join("System32")
            .join("config")
            .join("SAM")
    };
    assert_eq!(fs::read(sam("C")).unwrap(), b"now");
    assert_eq!(fs::read(sam("C (vsc {S1})")).unwrap(), b"then");
    assert_eq!(report.extraction.disambiguated, 0);
}

#[test]
fn test_reports_copied_to_target_directory() {
    let temp_dir = TempDir::new().unwrap();
    let archive = MemoryArchive::new(
        MemoryContainer::new()
            .with_container(
                "General.7z",
                MemoryContainer::new()
                    .with_file("GetThis.csv", getthis(&[]))
                    .with_file("autoruns.csv", "Entry,ImagePath\n"),
            )
            .with_file("Summary.txt", "ok"),
    );
    let mut config = RebuildConfig::default();
    config.reports.filenames = vec![
        "General.7z/autoruns.csv".to_string(),
        "./Summary.txt".to_string(),
    ];
    config.reports.target_directory = "outputs".to_string();

    let report = Rebuilder::new(archive, config)
        .run(temp_dir.path())
        .unwrap();

    let outputs = temp_dir.path().join("outputs");
    assert_eq!(
        fs::read(outputs.join("autoruns.csv")).unwrap(),
        b"Entry,ImagePath\n"
    );
    assert_eq!(fs::read(outputs.join("Summary.txt")).unwrap(), b"ok");
    assert_eq!(report.extraction.reports_copied, 2);
}

#[test]
fn test_reports_not_copied_without_manifest() {
    let temp_dir = TempDir::new().unwrap();
    let archive = MemoryArchive::new(MemoryContainer::new().with_file("Summary.txt", "ok"));
    let mut config = RebuildConfig::default();
    config.reports.filenames = vec!["./Summary.txt".to_string()];

    let err = Rebuilder::new(archive, config)
        .run(temp_dir.path())
        .unwrap_err();

    assert!(matches!(err, RebuildError::NoManifest { .. }));
    assert!(!temp_dir.path().join("reports").exists());
    assert!(tree(temp_dir.path()).is_empty());
}

#[test]
fn test_write_error_does_not_stop_the_container() {
    let temp_dir = TempDir::new().unwrap();
    let general = MemoryContainer::new()
        .with_file(
            "GetThis.csv",
            getthis(&[
                getthis_row("{V1}", "C:\\Tools\\run", "s\\run_data", LIVE),
                getthis_row("{V1}", "C:\\Tools\\run\\cfg.ini", "s\\cfg_data", LIVE),
                getthis_row("{V1}", "C:\\Tools\\other.ini", "s\\other_data", LIVE),
            ]),
        )
        .with_file("s/run_data", "EXE!")
        .with_file("s/cfg_data", "[cfg]")
        .with_file("s/other_data", "[oth]")
        .with_file("volstats.csv", volstats());
    let archive = MemoryArchive::new(MemoryContainer::new().with_container("General.7z", general));

    let report = Rebuilder::new(archive, RebuildConfig::default())
        .run(temp_dir.path())
        .unwrap();

    let tools = temp_dir.path().join("C").join("Tools");
    assert_eq!(fs::read(tools.join("run")).unwrap(), b"EXE!");
    assert_eq!(fs::read(tools.join("other.ini")).unwrap(), b"[oth]");
    assert!(!tools.join("run").join("cfg.ini").exists());
    assert_eq!(report.extraction.files_written, 2);

    let records = read_csv(&report.audit_file).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].original_path, "C:\\Tools\\run\\cfg.ini");
    assert_eq!(records[0].reason, ReasonCode::WriteError);
}

#[test]
fn test_extra_manifest_schema_with_status_column() {
    let temp_dir = TempDir::new().unwrap();
    let archive = MemoryArchive::new(
        MemoryContainer::new()
            .with_file("GetThis.csv", getthis(&[]))
            .with_file(
                "tools/autoruns.csv",
                "Sample,ImagePath,VolumeID,Collected\n\
                 bin/a.exe,C:\\Tools\\a.exe,{V1},true\n\
                 ,C:\\Tools\\b.exe,{V1},false\n",
            )
            .with_file("tools/bin/a.exe", "MZ"),
    );
    let config = RebuildConfig::from_toml(
        r#"
        [[manifests]]
        file_name = "autoruns.csv"
        [manifests.columns]
        archive_path = "Sample"
        original_path = "ImagePath"
        status = "Collected"
        "#,
    )
    .unwrap();

    let report = Rebuilder::new(archive, config)
        .run(temp_dir.path())
        .unwrap();

    assert_eq!(
        fs::read(temp_dir.path().join("{V1}").join("Tools").join("a.exe")).unwrap(),
        b"MZ"
    );
    let records = read_csv(&report.audit_file).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].original_path, "C:\\Tools\\b.exe");
    assert_eq!(records[0].reason, ReasonCode::NotExtractedByCollector);
}

#[test]
fn test_no_manifest_is_fatal_but_audit_is_written() {
    let temp_dir = TempDir::new().unwrap();
    let archive = MemoryArchive::new(
        MemoryContainer::new()
            .with_file("readme.txt", "nothing here")
            .with_container("Detail.7z", MemoryContainer::new().protected("x")),
    );

    let err = Rebuilder::new(archive, RebuildConfig::default())
        .run(temp_dir.path())
        .unwrap_err();
    match err {
        RebuildError::NoManifest { audit_file } => {
            let records = read_csv(audit_file).unwrap();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].reason, ReasonCode::ArchiveReadError);
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn test_protected_top_level_archive() {
    let temp_dir = TempDir::new().unwrap();
    let archive = || {
        MemoryArchive::new(
            MemoryContainer::new()
                .protected("toplevel")
                .with_file("GetThis.csv", getthis(&[getthis_row("{V1}", "C:\\a", "a", LIVE)]))
                .with_file("a", "a"),
        )
    };

    let err = Rebuilder::new(archive(), RebuildConfig::default())
        .run(temp_dir.path())
        .unwrap_err();
    assert!(matches!(err, RebuildError::Archive(_)));

    let config = RebuildConfig::default().with_password(".", "toplevel");
    let report = Rebuilder::new(archive(), config)
        .run(temp_dir.path())
        .unwrap();
    assert_eq!(report.extraction.files_written, 1);
}

#[test]
fn test_progress_callback_and_summary_json() {
    let temp_dir = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let mut rebuilder = Rebuilder::new(scenario_d(), RebuildConfig::default());
    rebuilder.set_progress_callback(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let report = rebuilder.run(temp_dir.path()).unwrap();

    assert!(calls.load(Ordering::SeqCst) >= 4);

    let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(json["extraction"]["files_written"], 1);
    assert_eq!(json["audit"]["by_reason"]["archive-read-error"], 1);
    assert_eq!(json["volumes"][0]["label"], "C");
}

#[test]
fn test_plan_writes_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let out = temp_dir.path().join("out");
    let mut rebuilder = Rebuilder::new(scenario_d(), RebuildConfig::default());
    let planned = rebuilder.plan(&out).unwrap();

    assert_eq!(planned.len(), 2);
    assert_eq!(planned[0].destination, Some(out.join("C").join("ok.txt")));
    assert_eq!(planned[1].reason, Some(ReasonCode::ArchiveReadError));
    assert!(!out.exists());
}

#[test]
fn test_resolve_volumes() {
    let mut rebuilder = Rebuilder::new(scenario_d(), RebuildConfig::default());
    let volumes = rebuilder.resolve_volumes().unwrap();
    assert_eq!(volumes.label_for("{V1}"), "C");
    assert_eq!(volumes.label_for("{V2}"), "D");
}
