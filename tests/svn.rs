//! End-to-end Subversion lift scenarios: dump text in, commit DAG out,
//! re-emitted as a fast-import stream that parses back cleanly.

use git_surgeon::config::ReadOptions;
use git_surgeon::config::WriteOptions;
use git_surgeon::event::Event;
use git_surgeon::exporter::write_stream;
use git_surgeon::importer::read_auto_bytes;
use git_surgeon::repository::Repository;
use pretty_assertions::assert_eq;

fn props(entries: &[(&str, &str)]) -> String {
    let mut out = String::new();
    for (key, value) in entries {
        out.push_str(&format!(
            "K {}\n{}\nV {}\n{}\n",
            key.len(),
            key,
            value.len(),
            value
        ));
    }
    out.push_str("PROPS-END\n");
    out
}

fn revision(number: u64, log: &str, minute: u64, nodes: &str) -> String {
    let body = props(&[
        ("svn:log", log),
        ("svn:author", "esr"),
        ("svn:date", &format!("2020-09-13T12:{minute:02}:00.000000Z")),
    ]);
    format!(
        "Revision-number: {number}\nProp-content-length: {len}\nContent-length: {len}\n\n{body}\n{nodes}",
        len = body.len(),
    )
}

fn file_add(path: &str, content: &str) -> String {
    format!(
        "Node-path: {path}\nNode-kind: file\nNode-action: add\nText-content-length: {}\nContent-length: {}\n\n{content}\n",
        content.len(),
        content.len(),
    )
}

fn file_change(path: &str, content: &str) -> String {
    format!(
        "Node-path: {path}\nNode-kind: file\nNode-action: change\nText-content-length: {}\nContent-length: {}\n\n{content}\n",
        content.len(),
        content.len(),
    )
}

fn dir_add(path: &str) -> String {
    format!("Node-path: {path}\nNode-kind: dir\nNode-action: add\n\n")
}

fn dir_copy(path: &str, from: &str, rev: u64) -> String {
    format!(
        "Node-path: {path}\nNode-kind: dir\nNode-action: add\nNode-copyfrom-rev: {rev}\nNode-copyfrom-path: {from}\n\n"
    )
}

fn lift(dump: &str) -> Repository {
    read_auto_bytes(dump.as_bytes(), "svntest", &ReadOptions::default()).unwrap()
}

fn project_dump() -> String {
    let mut dump = String::from("SVN-fs-dump-format-version: 2\n\nUUID: f0000000-0000-0000-0000-00000000cafe\n\n");
    dump.push_str(&revision(
        1,
        "initial import",
        0,
        &(dir_add("trunk") + &file_add("trunk/Makefile", "all:\n") + &file_add("trunk/main.c", "int main;")),
    ));
    dump.push_str(&revision(
        2,
        "fix build",
        1,
        &file_change("trunk/Makefile", "all: main\n"),
    ));
    dump.push_str(&revision(
        3,
        "open stable branch",
        2,
        &dir_copy("branches/stable", "trunk", 2),
    ));
    dump.push_str(&revision(
        4,
        "stable-only fix",
        3,
        &file_change("branches/stable/main.c", "int main = 1;"),
    ));
    dump.push_str(&revision(
        5,
        "tag the release",
        4,
        &dir_copy("tags/release-1.0", "branches/stable", 4),
    ));
    dump
}

#[test]
fn test_project_lift_branches_and_tags() {
    let repo = lift(&project_dump());
    let commits: Vec<_> = repo.events.iter().filter_map(Event::as_commit).collect();
    let branches: Vec<&str> = commits.iter().map(|c| c.branch.as_str()).collect();
    assert_eq!(
        branches,
        vec!["refs/heads/master", "refs/heads/master", "refs/heads/stable"]
    );
    // The stable-only fix descends from the r2 trunk commit (the branch
    // creation commit tagified away).
    let stable = commits[2];
    assert_eq!(stable.legacy_id.as_deref(), Some("4"));
    let parent = repo.commit_by_mark(stable.parent_marks()[0]).unwrap();
    assert_eq!(parent.legacy_id.as_deref(), Some("2"));
    // The release tag attaches to the stable fix.
    let tags: Vec<_> = repo.events.iter().filter_map(Event::as_tag).collect();
    let release = tags.iter().find(|t| t.name == "release-1.0").unwrap();
    let target = repo
        .commit_by_mark(release.committish.mark().unwrap())
        .unwrap();
    assert_eq!(target.legacy_id.as_deref(), Some("4"));
    // The synthesized committer carries the UUID-less identity by default.
    assert_eq!(stable.committer.name, "esr");
    assert_eq!(stable.committer.email, "esr");
    assert!(repo.check_invariants().is_empty());
}

#[test]
fn test_use_uuid_synthesizes_email_domain() {
    let options = ReadOptions {
        use_uuid: true,
        ..Default::default()
    };
    let repo = read_auto_bytes(project_dump().as_bytes(), "svntest", &options).unwrap();
    let commit = repo.events.iter().filter_map(Event::as_commit).next().unwrap();
    assert_eq!(
        commit.committer.email,
        "esr@f0000000-0000-0000-0000-00000000cafe"
    );
}

#[test]
fn test_lifted_repo_emits_and_reparses() {
    let repo = lift(&project_dump());
    let mut out = Vec::new();
    write_stream(&repo, None, &WriteOptions::default(), &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("commit refs/heads/master"));
    assert!(text.contains("tag release-1.0"));
    let reparsed = read_auto_bytes(text.as_bytes(), "again", &ReadOptions::default()).unwrap();
    assert!(reparsed.check_invariants().is_empty());
    let commits_before = repo.events.iter().filter(|e| e.kind() == "commit").count();
    let commits_after = reparsed
        .events
        .iter()
        .filter(|e| e.kind() == "commit")
        .count();
    assert_eq!(commits_before, commits_after);
}

#[test]
fn test_legacy_flag_appends_ids() {
    let repo = lift(&project_dump());
    let options = WriteOptions {
        legacy: true,
        ..Default::default()
    };
    let mut out = Vec::new();
    write_stream(&repo, None, &options, &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("Legacy-ID: 2"));
    assert!(text.contains("Legacy-ID: 4"));
}

#[test]
fn test_empty_dump_boundary() {
    // Revision 0 plus a single empty trunk add: one root tag, no commits.
    let mut dump = String::from("SVN-fs-dump-format-version: 2\n\n");
    dump.push_str(
        "Revision-number: 0\nProp-content-length: 56\nContent-length: 56\n\nK 8\nsvn:date\nV 27\n2020-09-13T12:00:00.000000Z\nPROPS-END\n\n",
    );
    dump.push_str(&revision(1, "create trunk", 1, &dir_add("trunk")));
    let repo = lift(&dump);
    assert_eq!(
        repo.events.iter().filter(|e| e.kind() == "commit").count(),
        0
    );
    let tags: Vec<_> = repo.events.iter().filter_map(Event::as_tag).collect();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].name, "root");
}

#[test]
fn test_svn_selection_by_legacy_id() {
    let repo = lift(&project_dump());
    let selection = git_surgeon::selection::compile("<2>")
        .unwrap()
        .evaluate(&repo, None)
        .unwrap();
    assert_eq!(selection.len(), 1);
    let index = selection.first().unwrap();
    assert_eq!(
        repo.events[index].as_commit().unwrap().legacy_id.as_deref(),
        Some("2")
    );
}
