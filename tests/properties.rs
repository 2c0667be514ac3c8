//! Property tests: canonicalization must not change observable manifests,
//! and non-deleting squashes must not lose blob references.

use bstr::BString;
use git_surgeon::attribution::Attribution;
use git_surgeon::config::SquashPolicy;
use git_surgeon::date::Date;
use git_surgeon::event::Blob;
use git_surgeon::event::BlobBody;
use git_surgeon::event::Commit;
use git_surgeon::event::Committish;
use git_surgeon::event::Event;
use git_surgeon::event::FileOp;
use git_surgeon::event::MODE_NORMAL;
use git_surgeon::orderedset::OrderedIntSet;
use git_surgeon::repository::Repository;
use git_surgeon::surgery;
use proptest::prelude::*;

const PATHS: [&str; 5] = ["alpha", "beta", "gamma", "delta", "epsilon"];

#[derive(Debug, Clone)]
enum OpSpec {
    Modify(usize),
    Delete(usize),
    Rename(usize, usize),
    Copy(usize, usize),
}

fn op_strategy() -> impl Strategy<Value = OpSpec> {
    prop_oneof![
        (0..PATHS.len()).prop_map(OpSpec::Modify),
        (0..PATHS.len()).prop_map(OpSpec::Delete),
        (0..PATHS.len(), 0..PATHS.len()).prop_map(|(a, b)| OpSpec::Rename(a, b)),
        (0..PATHS.len(), 0..PATHS.len()).prop_map(|(a, b)| OpSpec::Copy(a, b)),
    ]
}

/// Builds a linear history, one commit per op list, all modify ops sharing
/// one blob.
fn build_repo(commits: &[Vec<OpSpec>]) -> Repository {
    let mut repo = Repository::new("prop");
    repo.events.push(Event::Blob(Blob::new(
        ":1",
        BlobBody::Memory(BString::from("content\n")),
    )));
    repo.note_mark(":1");
    let mut previous: Option<String> = None;
    for (i, ops) in commits.iter().enumerate() {
        let date = Date::from_epoch(1600000000 + i as i64 * 100, 0).unwrap();
        let mut commit = Commit::new(
            "refs/heads/master",
            Attribution::new("A", "a@x", date),
        );
        let mark = repo.new_mark();
        commit.mark = Some(mark.clone());
        commit.comment = format!("commit {i}\n").into();
        if let Some(parent) = &previous {
            commit.parents.push(Committish::Mark(parent.clone()));
        }
        for op in ops {
            commit.fileops.push(match op {
                OpSpec::Modify(p) => FileOp::modify(MODE_NORMAL, ":1", PATHS[*p]),
                OpSpec::Delete(p) => FileOp::delete(PATHS[*p]),
                OpSpec::Rename(a, b) => FileOp::Rename {
                    source: PATHS[*a].into(),
                    target: PATHS[*b].into(),
                },
                OpSpec::Copy(a, b) => FileOp::Copy {
                    source: PATHS[*a].into(),
                    target: PATHS[*b].into(),
                },
            });
        }
        previous = Some(mark);
        repo.events.push(Event::Commit(commit));
    }
    repo.rebuild_children();
    repo
}

fn manifests(repo: &Repository) -> Vec<Vec<(BString, String)>> {
    repo.events
        .iter()
        .filter_map(Event::as_commit)
        .map(|c| {
            repo.manifest(c.mark.as_deref().unwrap())
                .unwrap()
                .entries()
                .into_iter()
                .map(|(path, entry)| (path, entry.mode))
                .collect()
        })
        .collect()
}

/// Manifest snapshots keyed by mark, for the surviving-commit comparison.
fn manifests_by_mark(
    repo: &Repository,
) -> std::collections::BTreeMap<String, Vec<(BString, String)>> {
    repo.events
        .iter()
        .filter_map(Event::as_commit)
        .filter_map(|c| c.mark.clone())
        .map(|mark| {
            let entries = repo
                .manifest(&mark)
                .unwrap()
                .entries()
                .into_iter()
                .map(|(path, entry)| (path, entry.mode))
                .collect();
            (mark, entries)
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn canonicalize_preserves_manifests(
        commits in prop::collection::vec(
            prop::collection::vec(op_strategy(), 0..6),
            1..8,
        )
    ) {
        let mut repo = build_repo(&commits);
        let before = manifests(&repo);
        let indices: Vec<usize> = repo
            .events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.as_commit().is_some())
            .map(|(i, _)| i)
            .collect();
        for index in indices {
            surgery::canonicalize(&mut repo, index, false).unwrap();
        }
        let after = manifests(&repo);
        prop_assert_eq!(before, after);
    }

    #[test]
    fn pushforward_squash_preserves_surviving_manifests(
        commits in prop::collection::vec(
            prop::collection::vec(op_strategy(), 1..5),
            2..8,
        ),
        victim in 0usize..6,
    ) {
        let mut repo = build_repo(&commits);
        let commit_indices: Vec<usize> = repo
            .events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.as_commit().is_some())
            .map(|(i, _)| i)
            .collect();
        // Squash one non-tip commit so there is a pushforward recipient.
        let victim = commit_indices[victim % (commit_indices.len() - 1)];
        let victim_mark = repo.commit_at(victim).unwrap().mark.clone().unwrap();
        let mut before = manifests_by_mark(&repo);
        before.remove(&victim_mark);
        let selection: OrderedIntSet = [victim].into_iter().collect();
        let policy = SquashPolicy::from_flags(["--pushforward", "--quiet"]).unwrap();
        surgery::squash(&mut repo, &selection, &policy).unwrap();
        let after = manifests_by_mark(&repo);
        prop_assert_eq!(before, after);
    }
}
