//! End-to-end scenarios over the fast-import reader, the surgical kernel,
//! the selection evaluator and the serializer, on the two-commit history
//! used throughout the unit tests.

use git_surgeon::config::ReadOptions;
use git_surgeon::config::SquashPolicy;
use git_surgeon::config::WriteOptions;
use git_surgeon::event::Event;
use git_surgeon::exporter::write_stream;
use git_surgeon::importer::read_stream_bytes;
use git_surgeon::orderedset::OrderedIntSet;
use git_surgeon::repository::Repository;
use git_surgeon::selection;
use git_surgeon::surgery;
use bstr::ByteSlice as _;
use pretty_assertions::assert_eq;

const SMALL: &str = "\
blob
mark :1
data 6
hello

commit refs/heads/master
mark :2
committer A <a@x> 1600000000 +0000
data 4
ci1

M 100644 :1 README

commit refs/heads/master
mark :3
committer A <a@x> 1600000100 +0000
data 4
ci2

from :2
D README
";

fn read(stream: &str) -> Repository {
    read_stream_bytes(stream.as_bytes(), "test", &ReadOptions::default()).unwrap()
}

fn emit(repo: &Repository) -> String {
    let mut out = Vec::new();
    write_stream(repo, None, &WriteOptions::default(), &mut out).unwrap();
    String::from_utf8(out).unwrap()
}

fn select(repo: &Repository, expr: &str) -> Vec<usize> {
    selection::compile(expr)
        .unwrap()
        .evaluate(repo, None)
        .unwrap()
        .iter()
        .collect()
}

#[test]
fn test_idempotent_parse_emit() {
    let repo = read(SMALL);
    let first = emit(&repo);
    let second = emit(&read(&first));
    assert_eq!(first, second);

    // Structural identity of the re-parse.
    let reparsed = read(&first);
    assert_eq!(repo.events.len(), reparsed.events.len());
    for (a, b) in repo.events.iter().zip(reparsed.events.iter()) {
        assert_eq!(a.kind(), b.kind());
        assert_eq!(a.mark(), b.mark());
    }
    let c3 = repo.commit_by_mark(":3").unwrap();
    let r3 = reparsed.commit_by_mark(":3").unwrap();
    assert_eq!(c3.parents, r3.parents);
    assert_eq!(c3.fileops, r3.fileops);
    assert_eq!(c3.committer, r3.committer);
}

#[test]
fn test_selection_scenario() {
    let repo = read(SMALL);
    // Commits are events 2 and 3, i.e. 0-origin indices 1 and 2.
    assert_eq!(select(&repo, "=C"), vec![1, 2]);
    assert_eq!(select(&repo, "@min(=C)"), vec![1]);
    assert_eq!(select(&repo, "@max(=C)"), vec![2]);
    // The blob and both commits touch README.
    assert_eq!(select(&repo, "[README]"), vec![0, 1, 2]);
}

#[test]
fn test_squash_delete_tagify_scenario() {
    let mut repo = read(SMALL);
    let index = repo.find_mark(":2").unwrap();
    let selection: OrderedIntSet = [index].into_iter().collect();
    let policy = SquashPolicy::from_flags(["--delete", "--tagify"]).unwrap();
    surgery::squash(&mut repo, &selection, &policy).unwrap();
    surgery::renumber(&mut repo);

    let commits: Vec<_> = repo.events.iter().filter_map(Event::as_commit).collect();
    assert_eq!(commits.len(), 1);
    assert!(commits[0].parents.is_empty());
    let tags: Vec<_> = repo.events.iter().filter_map(Event::as_tag).collect();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].name, "emptycommit-mark2");
    let blobs = repo.events.iter().filter(|e| e.kind() == "blob").count();
    assert_eq!(blobs, 1);
}

#[test]
fn test_reparent_emits_synthetic_deleteall() {
    let mut repo = read(SMALL);
    let index = repo.find_mark(":3").unwrap();
    surgery::reparent(&mut repo, index, vec![], false).unwrap();
    let text = emit(&repo);
    // The second commit has no from line and a deleteall prefix.
    let tail = text.split("mark :3").nth(1).unwrap();
    assert!(!tail.contains("from :2"));
    assert!(tail.contains("deleteall"));
}

#[test]
fn test_path_rename_and_visibility() {
    let mut repo = read(SMALL);
    let all: OrderedIntSet = (0..repo.events.len()).collect();
    let pattern = regex::bytes::Regex::new("^README$").unwrap();
    git_surgeon::reorg::path_rename(&mut repo, &all, &pattern, "docs/README", true).unwrap();
    let c2 = repo.find_mark(":2").unwrap();
    let c3 = repo.find_mark(":3").unwrap();
    // Both fileops were rewritten.
    assert_eq!(
        repo.commit_at(c2).unwrap().fileops[0].paths()[0].to_string(),
        "docs/README"
    );
    assert_eq!(
        repo.commit_at(c3).unwrap().fileops[0].paths()[0].to_string(),
        "docs/README"
    );
    // The new path was deleted at :3 but is visible at :2.
    assert_eq!(repo.visible(c3, b"docs/README".as_bstr()), None);
    assert_eq!(repo.visible(c2, b"docs/README".as_bstr()), Some(c2));
}

#[test]
fn test_squash_pushforward_empty_selection_is_noop() {
    let mut repo = read(SMALL);
    let before = emit(&repo);
    let policy = SquashPolicy::from_flags(["--pushforward"]).unwrap();
    surgery::squash(&mut repo, &OrderedIntSet::new(), &policy).unwrap();
    assert_eq!(before, emit(&repo));
}

#[test]
fn test_renumber_involution_on_stream() {
    let mut repo = read(SMALL);
    surgery::renumber(&mut repo);
    let once = emit(&repo);
    surgery::renumber(&mut repo);
    assert_eq!(once, emit(&repo));
}

#[test]
fn test_resort_is_stable_on_sorted_input() {
    let mut repo = read(SMALL);
    let before = emit(&repo);
    surgery::resort(&mut repo).unwrap();
    assert_eq!(before, emit(&repo));
}

#[test]
fn test_blob_only_stream_round_trips() {
    let stream = "blob\nmark :1\ndata 6\nhello\n\n";
    let repo = read(stream);
    assert_eq!(repo.events.len(), 1);
    let text = emit(&repo);
    let again = emit(&read(&text));
    assert_eq!(text, again);
}

#[test]
fn test_canonicalize_preserves_manifest() {
    // A commit with composable stutter: create, delete, recreate, rename.
    let stream = "\
blob
mark :1
data 2
a

blob
mark :2
data 2
b

commit refs/heads/master
mark :3
committer A <a@x> 1600000000 +0000
data 5
base

M 100644 :1 keep

commit refs/heads/master
mark :4
committer A <a@x> 1600000100 +0000
data 5
work

from :3
M 100644 :1 tmp
D tmp
M 100644 :2 file
R file moved
";
    let mut repo = read(stream);
    let index = repo.find_mark(":4").unwrap();
    let before = repo.manifest(":4").unwrap().entries();
    surgery::canonicalize(&mut repo, index, false).unwrap();
    let after = repo.manifest(":4").unwrap().entries();
    assert_eq!(before, after);
    // And canonicalization is idempotent.
    let ops_once = repo.commit_at(index).unwrap().fileops.clone();
    surgery::canonicalize(&mut repo, index, false).unwrap();
    assert_eq!(ops_once, repo.commit_at(index).unwrap().fileops);
}

#[test]
fn test_unknown_name_is_empty_not_error() {
    let repo = read(SMALL);
    assert_eq!(select(&repo, "no-such-name"), Vec::<usize>::new());
}

#[test]
fn test_mailbox_round_trip_over_stream() {
    let mut repo = read(SMALL);
    let selection: OrderedIntSet = select(&repo, "=C").into_iter().collect();
    let text = git_surgeon::mailbox::message_out(&repo, &selection);
    let edited = text.replace("ci2", "reworded");
    let updated = git_surgeon::mailbox::message_in(&mut repo, &edited).unwrap();
    assert_eq!(updated, 2);
    assert!(emit(&repo).contains("reworded"));
}
