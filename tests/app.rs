mod common;

use std::path::Path;
use std::sync::{Mutex, mpsc};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;

use opendata_mirror::app::{App, EngineSettings, RunOptions, Selection};
use opendata_mirror::domain::DatasetKey;
use opendata_mirror::error::MirrorError;
use opendata_mirror::output::JsonOutput;
use opendata_mirror::remote::{SizeOracle, Transfer};
use opendata_mirror::scheduler::FileAction;

use common::{Fixture, MUON_FAMILY, MockRemote, exists, remote};

fn muon() -> DatasetKey {
    DatasetKey::new(MUON_FAMILY, "v1")
}

#[test]
fn second_download_pass_transfers_nothing() {
    let fixture = Fixture::new();
    let (a, b) = (remote("a.root"), remote("b.root"));
    fixture.write_manifest(&muon(), &[&a, &b]);
    let mock = MockRemote::default().with_size(&a, 10).with_size(&b, 20);
    let app = fixture.app(&mock);

    let first = app
        .download(&Selection::all(), RunOptions::default(), &JsonOutput)
        .unwrap();
    assert_eq!(first.totals.fetched, 2);
    assert_eq!(mock.transfer_count(), 2);
    let ledger_after_first = fixture.ledger_content(&muon()).unwrap();
    assert_eq!(ledger_after_first, format!("{a}\n{b}\n"));

    let second = app
        .download(&Selection::all(), RunOptions::default(), &JsonOutput)
        .unwrap();
    assert_eq!(mock.transfer_count(), 2);
    assert_eq!(second.totals.ledger_hits, 2);
    assert_eq!(fixture.ledger_content(&muon()).unwrap(), ledger_after_first);
}

#[test]
fn ledger_hit_is_not_revalidated_after_local_deletion() {
    let fixture = Fixture::new();
    let a = remote("a.root");
    fixture.write_manifest(&muon(), &[&a]);
    let mock = MockRemote::default().with_size(&a, 10);
    let app = fixture.app(&mock);

    app.download(&Selection::all(), RunOptions::default(), &JsonOutput)
        .unwrap();
    let local = fixture.local_path(&muon(), &a);
    std::fs::remove_file(local.as_std_path()).unwrap();

    // Download mode trusts the ledger; only an audit pass notices the missing file.
    let result = app
        .download(&Selection::all(), RunOptions::default(), &JsonOutput)
        .unwrap();
    assert_eq!(mock.transfer_count(), 1);
    assert_eq!(result.datasets[0].files[0].action, FileAction::LedgerHit);
    assert!(!exists(&local));

    app.audit(&Selection::all(), RunOptions::default(), &JsonOutput)
        .unwrap();
    assert!(fixture.ledger_content(&muon()).is_none());
}

#[test]
fn present_but_unledgered_files_are_left_for_audit() {
    let fixture = Fixture::new();
    let a = remote("a.root");
    fixture.write_manifest(&muon(), &[&a]);
    fixture.put_local(&muon(), &a, 7);
    let mock = MockRemote::default().with_size(&a, 7);
    let app = fixture.app(&mock);

    let result = app
        .download(&Selection::all(), RunOptions::default(), &JsonOutput)
        .unwrap();
    assert_eq!(mock.transfer_count(), 0);
    assert_eq!(
        result.datasets[0].files[0].action,
        FileAction::LocalPresent { size_bytes: 7 }
    );
    assert!(fixture.ledger_content(&muon()).is_none());
}

#[test]
fn failed_transfer_is_isolated_and_leaves_nothing_behind() {
    let fixture = Fixture::new();
    let (a, b) = (remote("a.root"), remote("b.root"));
    fixture.write_manifest(&muon(), &[&a, &b]);
    let mock = MockRemote::default()
        .failing_transfer(&a)
        .with_size(&b, 12);
    let app = fixture.app(&mock);

    let result = app
        .download(&Selection::all(), RunOptions::default(), &JsonOutput)
        .unwrap();
    let files = &result.datasets[0].files;
    assert_matches!(
        &files[0].action,
        FileAction::FetchFailed {
            transient: true,
            ..
        }
    );
    assert_eq!(files[1].action, FileAction::Fetched);
    assert_eq!(fixture.ledger_content(&muon()).unwrap(), format!("{b}\n"));

    let local_a = fixture.local_path(&muon(), &a);
    assert!(!exists(&local_a));
    let staging = local_a.with_file_name(".a.root.part");
    assert!(!exists(&staging));
}

#[test]
fn dry_run_download_touches_nothing() {
    let fixture = Fixture::new();
    let a = remote("a.root");
    fixture.write_manifest(&muon(), &[&a]);
    let mock = MockRemote::default().with_size(&a, 3);
    let app = fixture.app(&mock);

    let result = app
        .download(&Selection::all(), RunOptions { dry_run: true }, &JsonOutput)
        .unwrap();
    assert!(result.dry_run);
    assert_eq!(result.totals.would_fetch, 1);
    assert_eq!(mock.transfer_count(), 0);
    assert!(fixture.ledger_content(&muon()).is_none());
}

#[test]
fn audit_ledger_is_exactly_the_size_matches() {
    let fixture = Fixture::new();
    let (a, b, c, stale) = (
        remote("a.root"),
        remote("b.root"),
        remote("c.root"),
        remote("stale.root"),
    );
    fixture.write_manifest(&muon(), &[&a, &b, &c]);
    fixture.put_local(&muon(), &a, 100);
    fixture.put_local(&muon(), &b, 50);
    let mock = MockRemote::default()
        .with_size(&a, 100)
        .with_size(&b, 99)
        .with_size(&c, 1);
    let app = fixture.app(&mock);
    app.ledger().mark_verified(&muon(), &stale).unwrap();

    let result = app
        .audit(&Selection::all(), RunOptions::default(), &JsonOutput)
        .unwrap();
    let outcome = &result.datasets[0];
    assert_eq!(outcome.files[0].action, FileAction::SizeMatch { size_bytes: 100 });
    assert_eq!(
        outcome.files[1].action,
        FileAction::SizeMismatch {
            local_bytes: 50,
            remote_bytes: 99
        }
    );
    assert_eq!(outcome.files[2].action, FileAction::LocalAbsent);
    assert_eq!(outcome.ledger_entries, Some(1));
    assert_eq!(mock.size_query_count(), 2);
    assert_eq!(fixture.ledger_content(&muon()).unwrap(), format!("{a}\n"));

    // A second audit over unchanged state converges to the same ledger.
    app.audit(&Selection::all(), RunOptions::default(), &JsonOutput)
        .unwrap();
    assert_eq!(fixture.ledger_content(&muon()).unwrap(), format!("{a}\n"));
}

#[test]
fn oracle_failure_keeps_entry_unverified() {
    let fixture = Fixture::new();
    let (a, b) = (remote("a.root"), remote("b.root"));
    fixture.write_manifest(&muon(), &[&a, &b]);
    fixture.put_local(&muon(), &a, 10);
    fixture.put_local(&muon(), &b, 10);
    let mock = MockRemote::default().unreachable(&a);
    let app = fixture.app(&mock);
    app.ledger().mark_verified(&muon(), &a).unwrap();

    let result = app
        .audit(&Selection::all(), RunOptions::default(), &JsonOutput)
        .unwrap();
    let files = &result.datasets[0].files;
    assert_matches!(
        &files[0].action,
        FileAction::Unverifiable {
            not_found: false,
            ..
        }
    );
    assert_matches!(
        &files[1].action,
        FileAction::Unverifiable {
            not_found: true,
            ..
        }
    );
    assert_eq!(result.datasets[0].ledger_entries, Some(0));
    assert!(!exists(&fixture.store.ledger_path(&muon())));
}

#[test]
fn concurrent_size_queries_keep_manifest_order() {
    let fixture = Fixture::new();
    let names = (0..12).map(|i| remote(&format!("f{i}.root"))).collect::<Vec<_>>();
    let refs = names.iter().map(String::as_str).collect::<Vec<_>>();
    fixture.write_manifest(&muon(), &refs);
    let mut mock = MockRemote::default();
    for (index, name) in names.iter().enumerate() {
        fixture.put_local(&muon(), name, index as u64 + 1);
        mock = mock.with_size(name, index as u64 + 1);
    }
    let app = opendata_mirror::app::App::new(
        fixture.store.clone(),
        &mock,
        &mock,
        opendata_mirror::app::EngineSettings {
            oracle_concurrency: 4,
            ..Default::default()
        },
    );

    app.audit(&Selection::all(), RunOptions::default(), &JsonOutput)
        .unwrap();
    let expected = names.iter().map(|name| format!("{name}\n")).collect::<String>();
    assert_eq!(fixture.ledger_content(&muon()).unwrap(), expected);
    assert_eq!(mock.size_query_count(), 12);
}

#[test]
fn dry_run_audit_keeps_existing_ledger() {
    let fixture = Fixture::new();
    let a = remote("a.root");
    fixture.write_manifest(&muon(), &[&a]);
    let mock = MockRemote::default().with_size(&a, 5);
    let app = fixture.app(&mock);
    app.ledger().mark_verified(&muon(), &a).unwrap();

    let result = app
        .audit(&Selection::all(), RunOptions { dry_run: true }, &JsonOutput)
        .unwrap();
    assert_eq!(result.totals.local_absent, 1);
    assert_eq!(result.datasets[0].ledger_entries, None);
    assert_eq!(fixture.ledger_content(&muon()).unwrap(), format!("{a}\n"));
}

#[test]
fn malformed_manifest_does_not_stop_siblings() {
    let fixture = Fixture::new();
    let a = remote("a.root");
    fixture.write_manifest(&muon(), &[&a]);
    std::fs::write(
        fixture.store.roots().manifests.join("CMS_file_index.txt").as_std_path(),
        format!("{a}\n"),
    )
    .unwrap();
    let mock = MockRemote::default().with_size(&a, 1);
    let app = fixture.app(&mock);

    let result = app
        .download(&Selection::all(), RunOptions::default(), &JsonOutput)
        .unwrap();
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].manifest, "CMS_file_index.txt");
    assert_eq!(result.datasets.len(), 1);
    assert_eq!(result.totals.fetched, 1);
}

#[test]
fn keyword_narrows_selection() {
    let fixture = Fixture::new();
    let other = DatasetKey::new("CMS_Run2015D_DoubleEG_NANOAOD", "v1");
    let (a, b) = (remote("a.root"), remote("b.root"));
    fixture.write_manifest(&muon(), &[&a]);
    fixture.write_manifest(&other, &[&b]);
    let mock = MockRemote::default();
    let app = fixture.app(&mock);

    let result = app
        .download(
            &Selection::keyword("doubleeg"),
            RunOptions::default(),
            &JsonOutput,
        )
        .unwrap();
    assert_eq!(result.datasets.len(), 1);
    assert_eq!(result.datasets[0].dataset, other.to_string());
    assert_eq!(mock.transfer_count(), 1);
}

#[test]
fn missing_manifest_root_is_fatal() {
    let fixture = Fixture::new();
    std::fs::remove_dir_all(fixture.store.roots().manifests.as_std_path()).unwrap();
    let mock = MockRemote::default();
    let app = fixture.app(&mock);

    let err = app
        .download(&Selection::all(), RunOptions::default(), &JsonOutput)
        .unwrap_err();
    assert_matches!(err, MirrorError::StorageRoot(_));
}

/// Writes half the object, reports that it started, then waits to be released.
struct GatedRemote {
    size: u64,
    started: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl Transfer for GatedRemote {
    fn transfer(&self, _remote_path: &str, destination: &Path) -> Result<(), MirrorError> {
        std::fs::write(destination, vec![0u8; (self.size / 2) as usize]).unwrap();
        self.started.lock().unwrap().send(()).unwrap();
        self.release.lock().unwrap().recv().unwrap();
        std::fs::write(destination, vec![0u8; self.size as usize]).unwrap();
        Ok(())
    }
}

impl SizeOracle for GatedRemote {
    fn remote_size(&self, _remote_path: &str) -> Result<u64, MirrorError> {
        Ok(self.size)
    }
}

#[test]
fn overlapping_invocations_never_ledger_a_partial_copy() {
    let fixture = Fixture::new();
    let a = remote("a.root");
    fixture.write_manifest(&muon(), &[&a]);

    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let gated = GatedRemote {
        size: 10,
        started: Mutex::new(started_tx),
        release: Mutex::new(release_rx),
    };
    let truncating = MockRemote::default().with_size(&a, 3);
    let first = App::new(fixture.store.clone(), &gated, &gated, EngineSettings::default());
    let second = fixture.app(&truncating);

    let (first_result, second_result) = thread::scope(|scope| {
        let first_run = scope.spawn(|| {
            first
                .download(&Selection::all(), RunOptions::default(), &JsonOutput)
                .unwrap()
        });
        started_rx.recv().unwrap();
        let second_run = scope.spawn(|| {
            second
                .download(&Selection::all(), RunOptions::default(), &JsonOutput)
                .unwrap()
        });
        thread::sleep(Duration::from_millis(100));
        release_tx.send(()).unwrap();
        (first_run.join().unwrap(), second_run.join().unwrap())
    });

    assert_eq!(first_result.datasets[0].files[0].action, FileAction::Fetched);
    assert_eq!(second_result.datasets[0].files[0].action, FileAction::LedgerHit);
    assert_eq!(truncating.transfer_count(), 0);

    let local = fixture.local_path(&muon(), &a);
    let size = std::fs::metadata(local.as_std_path()).unwrap().len();
    assert_eq!(size, 10);
    assert_eq!(fixture.ledger_content(&muon()).unwrap(), format!("{a}\n"));
    assert!(!exists(&local.with_file_name(".a.root.part")));
}
