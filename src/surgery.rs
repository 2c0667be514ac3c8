use crate::config::SquashPolicy;
use crate::error::command_error;
use crate::event::Commit;
use crate::event::Committish;
use crate::event::Event;
use crate::event::FileOp;
use crate::event::Tag;
use crate::event::path_cmp_deep_first;
use crate::orderedset::OrderedIntSet;
use crate::repository::Repository;
use anyhow::Context as _;
use anyhow::Result;
use bstr::BStr;
use bstr::ByteSlice as _;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;

/// Composition-rule case numbers applied during canonicalization, kept for
/// coverage tracking in tests.
pub type CaseCoverage = BTreeSet<i32>;

// --- Canonicalization -----------------------------------------------------

/// Applies the pairwise fileop composition rules to a fixed point, then
/// sorts the result. `preexisting` reports whether a path was already
/// visible in the first parent's manifest, which decides the
/// first-ever-creation cases.
pub fn canonicalize_fileops(
    mut ops: Vec<FileOp>,
    preexisting: &dyn Fn(&BStr) -> bool,
    coalesce: bool,
    coverage: &mut CaseCoverage,
    warnings: &mut Vec<String>,
) -> Vec<FileOp> {
    // Only the rightmost deleteall and what follows it can matter.
    if let Some(pos) = ops.iter().rposition(FileOp::is_deleteall) {
        ops.drain(..pos);
    }

    'compose: loop {
        for i in 0..ops.len() {
            let left_paths: Vec<_> = ops[i].paths().iter().map(|p| p.to_owned()).collect();
            if left_paths.is_empty() {
                // deleteall composes with nothing on its right (case 7).
                continue;
            }
            // Whether a path is visible just before the left op: parent
            // manifest state threaded through the preceding ops.
            let existed = |path: &BStr| existed_before(&ops, i, path, preexisting);
            for j in i + 1..ops.len() {
                let overlaps = ops[j]
                    .paths()
                    .iter()
                    .any(|p| left_paths.iter().any(|lp| lp == p));
                if !overlaps {
                    continue;
                }
                match compose_pair(&ops[i], &ops[j], &existed, coverage, warnings) {
                    Composition::Unchanged => break,
                    Composition::Rewrite { left, right } => {
                        let mut changed = false;
                        if let Some(new_right) = right {
                            if ops[j] != new_right {
                                ops[j] = new_right;
                                changed = true;
                            }
                        } else {
                            ops.remove(j);
                            changed = true;
                        }
                        if let Some(new_left) = left {
                            if ops[i] != new_left {
                                ops[i] = new_left;
                                changed = true;
                            }
                        } else {
                            ops.remove(i);
                            changed = true;
                        }
                        if changed {
                            continue 'compose;
                        }
                        break;
                    }
                }
            }
        }
        break;
    }

    if coalesce {
        // Retain only the last M per path.
        let mut seen: HashSet<bstr::BString> = HashSet::new();
        let mut kept: Vec<FileOp> = Vec::new();
        for op in ops.into_iter().rev() {
            if let FileOp::Modify { path, .. } = &op {
                if !seen.insert(path.clone()) {
                    continue;
                }
            }
            kept.push(op);
        }
        kept.reverse();
        ops = kept;
    }

    // Reordering is only sound once the surviving ops are path-disjoint;
    // overlapping pairs that no rule covers keep their original order.
    let mut seen_paths: HashSet<bstr::BString> = HashSet::new();
    let disjoint = ops.iter().all(|op| {
        op.paths()
            .iter()
            .all(|p| seen_paths.insert((*p).to_owned()))
    });
    if disjoint {
        sort_fileops(&mut ops);
    }
    ops
}

/// Whether `path` is visible just before op `upto`: the first-parent
/// manifest state threaded through the preceding ops of the same commit.
fn existed_before(
    ops: &[FileOp],
    upto: usize,
    path: &BStr,
    preexisting: &dyn Fn(&BStr) -> bool,
) -> bool {
    let mut exists = preexisting(path);
    for op in &ops[..upto] {
        match op {
            FileOp::Modify { path: p, .. } if p.as_bstr() == path => exists = true,
            FileOp::Delete { path: p } if p.as_bstr() == path => exists = false,
            FileOp::Rename { source, target } => {
                if target.as_bstr() == path {
                    exists = true;
                } else if source.as_bstr() == path {
                    exists = false;
                }
            }
            FileOp::Copy { target, .. } if target.as_bstr() == path => exists = true,
            FileOp::DeleteAll => exists = false,
            _ => {}
        }
    }
    exists
}

enum Composition {
    /// No rule applies to this pair.
    Unchanged,
    /// Rewrite or drop the two ops independently.
    Rewrite {
        left: Option<FileOp>,
        right: Option<FileOp>,
    },
}

fn compose_pair(
    left: &FileOp,
    right: &FileOp,
    existed: &dyn Fn(&BStr) -> bool,
    coverage: &mut CaseCoverage,
    warnings: &mut Vec<String>,
) -> Composition {
    use Composition::Rewrite;
    use Composition::Unchanged;
    match (left, right) {
        (FileOp::Modify { path: a, .. }, FileOp::Modify { path: b, .. }) if a == b => {
            // Handled by clique logic / coalesce.
            coverage.insert(0);
            Unchanged
        }
        (FileOp::Modify { path: a, .. }, FileOp::Delete { path: b }) if a == b => {
            if !existed(a.as_bstr()) {
                // The M created the file; the pair annihilates.
                coverage.insert(1);
                Rewrite {
                    left: None,
                    right: None,
                }
            } else {
                coverage.insert(2);
                Rewrite {
                    left: None,
                    right: Some(right.clone()),
                }
            }
        }
        (
            FileOp::Modify {
                mode,
                blobref,
                path: a,
            },
            FileOp::Rename { source, target },
        ) if a == source => {
            let moved = FileOp::Modify {
                mode: mode.clone(),
                blobref: blobref.clone(),
                path: target.clone(),
            };
            if !existed(a.as_bstr()) {
                // The rename of a file this commit created collapses into a
                // create at the target.
                coverage.insert(4);
                Rewrite {
                    left: None,
                    right: Some(moved),
                }
            } else {
                coverage.insert(3);
                Rewrite {
                    left: Some(right.clone()),
                    right: Some(moved),
                }
            }
        }
        (FileOp::Modify { path: a, .. }, FileOp::Copy { source, .. }) if a == source => {
            coverage.insert(5);
            Unchanged
        }
        (FileOp::Delete { path: a }, FileOp::Modify { path: b, .. }) if a == b => {
            coverage.insert(6);
            Rewrite {
                left: None,
                right: Some(right.clone()),
            }
        }
        (FileOp::Delete { path: a }, FileOp::Delete { path: b }) if a == b => {
            coverage.insert(-2);
            Rewrite {
                left: Some(left.clone()),
                right: None,
            }
        }
        (FileOp::Delete { path: a }, FileOp::Rename { source, .. }) if a == source => {
            coverage.insert(-3);
            warnings.push(format!("rename of deleted path {a:?}"));
            Unchanged
        }
        (FileOp::Delete { path: a }, FileOp::Copy { source, .. }) if a == source => {
            coverage.insert(8);
            warnings.push(format!("copy of deleted path {a:?}"));
            Unchanged
        }
        (FileOp::Rename { source, target }, FileOp::Delete { path }) if path == target => {
            coverage.insert(9);
            // If the rename clobbered a preexisting target, that path still
            // needs its delete.
            Rewrite {
                left: Some(FileOp::Delete {
                    path: source.clone(),
                }),
                right: existed(target.as_bstr()).then(|| right.clone()),
            }
        }
        (FileOp::Rename { source, .. }, FileOp::Delete { path }) if path == source => {
            coverage.insert(-4);
            warnings.push(format!("delete of renamed-away path {path:?}"));
            Rewrite {
                left: Some(left.clone()),
                right: None,
            }
        }
        (
            FileOp::Rename { source, target },
            FileOp::Rename {
                source: source2,
                target: target2,
            },
        ) if target == source2 => {
            coverage.insert(11);
            // A preexisting waypoint was overwritten and then vacated.
            Rewrite {
                left: Some(FileOp::Rename {
                    source: source.clone(),
                    target: target2.clone(),
                }),
                right: existed(target.as_bstr()).then(|| FileOp::Delete {
                    path: target.clone(),
                }),
            }
        }
        (FileOp::Copy { source, target }, FileOp::Delete { path }) if path == source => {
            coverage.insert(13);
            Rewrite {
                left: Some(FileOp::Rename {
                    source: source.clone(),
                    target: target.clone(),
                }),
                right: None,
            }
        }
        (FileOp::Copy { target, .. }, FileOp::Delete { path }) if path == target => {
            coverage.insert(14);
            // If the copy landed on a preexisting path, the delete still
            // applies to it.
            Rewrite {
                left: None,
                right: existed(target.as_bstr()).then(|| right.clone()),
            }
        }
        (
            FileOp::Copy { source, target },
            FileOp::Rename {
                source: source2,
                target: target2,
            },
        ) if target == source2 => {
            coverage.insert(16);
            Rewrite {
                left: Some(FileOp::Copy {
                    source: source.clone(),
                    target: target2.clone(),
                }),
                right: existed(target.as_bstr()).then(|| FileOp::Delete {
                    path: target.clone(),
                }),
            }
        }
        _ => Unchanged,
    }
}

/// Sorts fileops: a leading deleteall stays put, renames float to the end,
/// everything else sorts by path with directory contents before the
/// directory's own name.
pub fn sort_fileops(ops: &mut Vec<FileOp>) {
    let deleteall: Vec<FileOp> = ops.iter().filter(|op| op.is_deleteall()).cloned().collect();
    let renames: Vec<FileOp> = ops
        .iter()
        .filter(|op| matches!(op, FileOp::Rename { .. }))
        .cloned()
        .collect();
    let mut plain: Vec<FileOp> = ops
        .iter()
        .filter(|op| !op.is_deleteall() && !matches!(op, FileOp::Rename { .. }))
        .cloned()
        .collect();
    plain.sort_by(|a, b| {
        let pa = a.paths();
        let pb = b.paths();
        path_cmp_deep_first(pa[0], pb[0])
    });
    let mut out = deleteall;
    out.extend(plain);
    out.extend(renames);
    *ops = out;
}

/// Canonicalizes one commit's fileops in place.
pub fn canonicalize(repo: &mut Repository, index: usize, coalesce: bool) -> Result<CaseCoverage> {
    let commit = repo
        .commit_at(index)
        .with_context(|| format!("event {index} is not a commit"))?;
    let parent_manifest = match commit.first_parent_mark() {
        Some(parent) => repo.manifest(parent)?,
        None => crate::event::Manifest::new(),
    };
    let ops = commit.fileops.clone();
    let mark = commit.mark.clone();
    let mut coverage = CaseCoverage::new();
    let mut warnings = Vec::new();
    let preexisting = |path: &BStr| parent_manifest.contains(path);
    let cooked = canonicalize_fileops(ops, &preexisting, coalesce, &mut coverage, &mut warnings);
    for warning in warnings {
        log::warn!("{warning}");
    }
    repo.commit_mut_at(index).unwrap().fileops = cooked;
    if let Some(mark) = mark {
        repo.invalidate_manifests_from(&mark);
    }
    Ok(coverage)
}

// --- Squash / delete ------------------------------------------------------

/// Deletes the selected commits, propagating side effects per the policy
/// flags. Validation happens before any mutation so a command error leaves
/// the repository untouched.
#[tracing::instrument(skip_all, fields(selected = selection.len()))]
pub fn squash(repo: &mut Repository, selection: &OrderedIntSet, policy: &SquashPolicy) -> Result<()> {
    let mut indices: Vec<usize> = selection.iter().collect();
    indices.sort_unstable();
    for &index in &indices {
        if repo.commit_at(index).is_none() {
            return Err(command_error(format!(
                "squash selection includes non-commit event {index}"
            )));
        }
    }
    if policy.empty_only {
        for &index in &indices {
            let commit = repo.commit_at(index).unwrap();
            if commit.comment.trim().is_empty() {
                continue;
            }
            for recipient in comment_recipients(repo, commit, policy) {
                let target = repo.commit_by_mark(&recipient).unwrap();
                if !target.comment.trim().is_empty() {
                    return Err(command_error(format!(
                        "--empty-only: commit {recipient} already has a comment"
                    )));
                }
            }
        }
    }

    // Process in ascending order; commits are re-found by mark each round
    // because pushback can reorder the event list.
    let marks: Vec<String> = indices
        .iter()
        .filter_map(|&i| repo.commit_at(i).and_then(|c| c.mark.clone()))
        .collect();
    let mut recipients: Vec<String> = Vec::new();

    for mark in &marks {
        let index = repo
            .find_mark(mark)
            .with_context(|| format!("commit {mark} vanished mid-squash"))?;
        let commit = repo.commit_at(index).unwrap().clone();

        // Policy: move fileops.
        if policy.pushback {
            if let Some(parent_mark) = commit.first_parent_mark().map(str::to_owned) {
                push_ops_back(repo, &commit, &parent_mark, policy)?;
            } else if policy.complain {
                log::warn!("pushback from parentless commit {mark} discards fileops");
            }
        } else if policy.effective_pushforward() {
            recipients.extend(push_ops_forward(repo, &commit, policy)?);
        }

        // Splice children's parent lists.
        for child_mark in commit.children.clone() {
            splice_parents(repo, &child_mark, &commit)?;
        }

        // Re-target or delete attachments. Explicit --tagback/--tagforward
        // win; hard deletion without --tagify takes the tags down too.
        let attachments = repo.attachments(mark);
        let new_target = if policy.tagforward {
            commit.children.first().cloned().map(Committish::Mark)
        } else if policy.tagback {
            commit
                .first_parent_mark()
                .map(|m| Committish::Mark(m.to_owned()))
        } else if policy.delete && !policy.tagify {
            None
        } else if policy.effective_tagforward() {
            commit.children.first().cloned().map(Committish::Mark)
        } else {
            commit
                .first_parent_mark()
                .map(|m| Committish::Mark(m.to_owned()))
        };
        let mut doomed_attachments = Vec::new();
        for attachment_index in attachments {
            match (&new_target, &mut repo.events[attachment_index]) {
                (Some(target), Event::Tag(tag)) => tag.committish = target.clone(),
                (Some(target), Event::Reset(reset)) => {
                    reset.committish = Some(target.clone());
                }
                (None, _) => doomed_attachments.push(attachment_index),
                _ => {}
            }
        }
        // Attachments always follow their target, so removing them does not
        // shift this commit's index.
        doomed_attachments.sort_unstable();
        for attachment_index in doomed_attachments.into_iter().rev() {
            repo.events.remove(attachment_index);
        }

        // Optionally leave a tag marking where the commit was. Re-find the
        // commit: pushback may have reordered the event list.
        if policy.tagify {
            let index = repo
                .find_mark(mark)
                .with_context(|| format!("commit {mark} vanished before tagify"))?;
            tagify_commit(repo, index, None, false)?;
        }

        repo.declare_sequence_mutation();
        repo.rebuild_children();
    }

    // Remove the doomed commits in one retain pass.
    let doomed_events: HashSet<usize> = marks.iter().filter_map(|m| repo.find_mark(m)).collect();
    let mut kept = Vec::with_capacity(repo.events.len());
    for (i, event) in repo.events.drain(..).enumerate() {
        if !doomed_events.contains(&i) {
            kept.push(event);
        }
    }
    repo.events = kept;
    repo.declare_sequence_mutation();
    repo.rebuild_children();
    // Pushforward recipients get their enlarged fileop lists composed down.
    let mut case_coverage = CaseCoverage::new();
    for recipient in recipients {
        if let Some(index) = repo.find_mark(&recipient) {
            case_coverage.extend(canonicalize(repo, index, policy.coalesce)?);
        }
    }
    if !case_coverage.is_empty() {
        log::debug!("squash canonicalization used cases {case_coverage:?}");
    }
    if !policy.tagify {
        repo.gc_blobs();
    }
    Ok(())
}

/// The marks of commits that would inherit the deleted commit's comment.
fn comment_recipients(repo: &Repository, commit: &Commit, policy: &SquashPolicy) -> Vec<String> {
    if policy.pushback {
        commit
            .first_parent_mark()
            .map(str::to_owned)
            .into_iter()
            .collect()
    } else if policy.effective_pushforward() {
        commit
            .children
            .iter()
            .filter(|child| {
                repo.commit_by_mark(child)
                    .is_some_and(|c| c.first_parent_mark() == commit.mark.as_deref())
            })
            .cloned()
            .collect()
    } else {
        Vec::new()
    }
}

fn merge_comment(recipient: &mut Commit, donor: &Commit, policy: &SquashPolicy) {
    if donor.comment.trim().is_empty() {
        return;
    }
    if recipient.comment.trim().is_empty() {
        recipient.comment = donor.comment.clone();
    } else if policy.complain && !policy.quiet {
        log::warn!(
            "squash discards comment of {}",
            donor.mark.as_deref().unwrap_or("<unmarked>")
        );
    }
}

/// Appends the deleted commit's fileops to its first parent, relocating any
/// referenced blobs so they still precede the parent in event order.
fn push_ops_back(
    repo: &mut Repository,
    commit: &Commit,
    parent_mark: &str,
    policy: &SquashPolicy,
) -> Result<()> {
    let parent_index = repo
        .find_mark(parent_mark)
        .with_context(|| format!("no parent {parent_mark}"))?;
    // Blobs referenced by the moved ops must precede the receiving commit.
    let moved_blob_marks: Vec<String> = commit
        .fileops
        .iter()
        .filter_map(|op| op.blob_mark().map(str::to_owned))
        .collect();
    let mut blob_moves: Vec<usize> = moved_blob_marks
        .iter()
        .filter_map(|m| repo.find_mark(m))
        .filter(|&i| i > parent_index)
        .collect();
    blob_moves.sort_unstable();
    // Extract from the tail first so earlier indices stay valid.
    let mut moved_events = Vec::new();
    for &i in blob_moves.iter().rev() {
        moved_events.push(repo.events.remove(i));
    }
    moved_events.reverse();
    let insert_at = repo
        .events
        .iter()
        .position(|e| e.mark() == Some(parent_mark))
        .with_context(|| format!("parent {parent_mark} vanished"))?;
    for event in moved_events.into_iter().rev() {
        repo.events.insert(insert_at, event);
    }
    repo.declare_sequence_mutation();
    let parent_index = repo.find_mark(parent_mark).unwrap();
    let parent = repo.commit_mut_at(parent_index).unwrap();
    parent.fileops.extend(commit.fileops.iter().cloned());
    merge_comment(parent, commit, policy);
    Ok(())
}

/// Prepends the deleted commit's fileops to each child whose first parent is
/// the deleted commit. Returns the receiving marks; they get canonicalized
/// once the squash completes.
fn push_ops_forward(
    repo: &mut Repository,
    commit: &Commit,
    policy: &SquashPolicy,
) -> Result<Vec<String>> {
    let Some(mark) = commit.mark.as_deref() else {
        return Ok(Vec::new());
    };
    let mut recipients = Vec::new();
    for child_mark in &commit.children {
        let child_index = repo
            .find_mark(child_mark)
            .with_context(|| format!("no child {child_mark}"))?;
        let child = repo.commit_mut_at(child_index).unwrap();
        if child.first_parent_mark() != Some(mark) {
            continue;
        }
        let mut new_ops = commit.fileops.clone();
        // When the deleted commit was a root, the child is about to be
        // rebased onto a different lineage; a deleteall keeps its manifest
        // identical.
        if commit.parents.is_empty() && child.parents.len() > 1 {
            new_ops.insert(0, FileOp::DeleteAll);
        }
        new_ops.extend(child.fileops.drain(..));
        child.fileops = new_ops;
        merge_comment(child, commit, policy);
        recipients.push(child_mark.clone());
    }
    Ok(recipients)
}

/// Replaces the deleted commit in a child's parent list with the deleted
/// commit's own parents, in place, preserving existing duplicate structure
/// and not introducing new duplicates.
fn splice_parents(repo: &mut Repository, child_mark: &str, deleted: &Commit) -> Result<()> {
    let deleted_mark = deleted.mark.as_deref().unwrap_or_default();
    let child_index = repo
        .find_mark(child_mark)
        .with_context(|| format!("no child {child_mark}"))?;
    let child = repo.commit_at(child_index).unwrap();
    let mut new_parents: Vec<Committish> = Vec::new();
    for parent in &child.parents {
        if parent.mark() == Some(deleted_mark) {
            for grand in &deleted.parents {
                let duplicate = new_parents.contains(grand)
                    || child
                        .parents
                        .iter()
                        .any(|p| p != parent && p == grand);
                if !duplicate {
                    new_parents.push(grand.clone());
                }
            }
        } else {
            new_parents.push(parent.clone());
        }
    }
    repo.set_parents(child_index, new_parents)
}

// --- Tagify ---------------------------------------------------------------

/// Converts the commit at `index` into an annotated tag on its first parent
/// (falling back to its first child). The caller removes the commit event.
/// With `allow_callout`, a commit with nothing to attach to yields a tag
/// whose committish is its own action-stamp callout; otherwise that case is
/// a diagnostic and no tag is created.
pub fn tagify_commit(
    repo: &mut Repository,
    index: usize,
    name: Option<String>,
    allow_callout: bool,
) -> Result<Option<String>> {
    let commit = repo
        .commit_at(index)
        .with_context(|| format!("event {index} is not a commit"))?
        .clone();
    let name = name.unwrap_or_else(|| default_tag_name(&commit, index));
    let name = uncollide_tag_name(repo, name);
    let target = commit
        .first_parent_mark()
        .map(|m| Committish::Mark(m.to_owned()))
        .or_else(|| commit.children.first().cloned().map(Committish::Mark))
        .or_else(|| allow_callout.then(|| Committish::Callout(commit.action_stamp())));
    let Some(target) = target else {
        log::warn!(
            "cannot tagify {}: no parent or child to attach to",
            commit.mark.as_deref().unwrap_or("<unmarked>")
        );
        return Ok(None);
    };
    let mut tag = Tag::new(name.clone(), target);
    tag.tagger = Some(
        commit
            .authors
            .first()
            .cloned()
            .unwrap_or_else(|| commit.committer.clone()),
    );
    tag.comment = commit.comment.clone();
    tag.legacy_id = commit.legacy_id.clone();
    repo.events.push(Event::Tag(tag));
    repo.declare_sequence_mutation();
    Ok(Some(name))
}

/// The default tag namer: prefer the legacy ID, then the mark, then the
/// event index.
pub fn default_tag_name(commit: &Commit, index: usize) -> String {
    if let Some(legacy) = &commit.legacy_id {
        format!("emptycommit-{legacy}")
    } else if let Some(mark) = &commit.mark {
        format!("emptycommit-mark{}", mark.trim_start_matches(':'))
    } else {
        format!("emptycommit-index{index}")
    }
}

fn uncollide_tag_name(repo: &Repository, name: String) -> String {
    let taken: HashSet<&str> = repo
        .events
        .iter()
        .filter_map(Event::as_tag)
        .map(|t| t.name.as_str())
        .collect();
    if !taken.contains(name.as_str()) {
        return name;
    }
    let mut candidate = format!("{name}-displaced");
    while taken.contains(candidate.as_str()) {
        candidate.push_str("-displaced");
    }
    candidate
}

/// Converts every empty commit in the selection (all commits by default)
/// into an annotated tag. Merge commits are skipped unless
/// `tagify_merges`; tipdelete commits participate only under `tipdeletes`.
pub fn tagify_empty(
    repo: &mut Repository,
    selection: Option<&OrderedIntSet>,
    tipdeletes: bool,
    tagify_merges: bool,
    namer: Option<&dyn Fn(&Commit, usize) -> String>,
) -> Result<usize> {
    let candidates: Vec<usize> = match selection {
        Some(sel) => sel.iter().collect(),
        None => (0..repo.events.len()).collect(),
    };
    let mut doomed: Vec<String> = Vec::new();
    for index in candidates {
        let Some(commit) = repo.commit_at(index) else {
            continue;
        };
        let eligible = commit.is_empty() || (tipdeletes && commit.is_tipdelete());
        if !eligible {
            continue;
        }
        if commit.is_merge() && !tagify_merges {
            continue;
        }
        let name = namer.map(|f| f(commit, index));
        if tagify_commit(repo, index, name, false)?.is_some()
            && let Some(mark) = repo.commit_at(index).and_then(|c| c.mark.clone())
        {
            doomed.push(mark);
        }
    }
    let count = doomed.len();
    if !doomed.is_empty() {
        let policy = SquashPolicy {
            delete: true,
            tagback: true,
            quiet: true,
            ..Default::default()
        };
        let selection: OrderedIntSet = doomed
            .iter()
            .filter_map(|m| repo.find_mark(m))
            .collect();
        squash(repo, &selection, &policy)?;
    }
    Ok(count)
}

// --- Reparent -------------------------------------------------------------

/// Replaces a commit's parent list. Without `rebase`, a synthetic deleteall
/// plus modify ops reconstructing the old manifest is prepended so the tree
/// contents are unchanged despite the new ancestry.
pub fn reparent(
    repo: &mut Repository,
    index: usize,
    parents: Vec<Committish>,
    rebase: bool,
) -> Result<()> {
    let commit = repo
        .commit_at(index)
        .with_context(|| format!("event {index} is not a commit"))?;
    for parent in &parents {
        if let Some(mark) = parent.mark() {
            let pidx = repo
                .find_mark(mark)
                .ok_or_else(|| command_error(format!("no parent with mark {mark}")))?;
            if pidx >= index {
                return Err(command_error(format!(
                    "parent {mark} does not precede the commit"
                )));
            }
        }
    }
    if !rebase {
        let mark = commit
            .mark
            .clone()
            .ok_or_else(|| command_error("cannot reparent an unmarked commit"))?;
        let old_manifest = repo.manifest(&mark)?;
        let mut ops = vec![FileOp::DeleteAll];
        for (path, entry) in old_manifest.entries() {
            ops.push(FileOp::Modify {
                mode: entry.mode,
                blobref: entry.blobref,
                path,
            });
        }
        repo.commit_mut_at(index).unwrap().fileops = ops;
    }
    repo.set_parents(index, parents)?;
    Ok(())
}

// --- Resort ---------------------------------------------------------------

/// Topologically sorts the event list so every referent precedes its
/// referrers, breaking ties by original index so an already-sorted list is
/// untouched. Assignment sets are remapped through the old-to-new index map.
/// Cycles are reported without mutating the sequence.
pub fn resort(repo: &mut Repository) -> Result<()> {
    let n = repo.events.len();
    // Dependency edges: event depends on (must follow) its referents.
    let mut deps: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, event) in repo.events.iter().enumerate() {
        let mut wants = |mark: &str| {
            if let Some(j) = repo.find_mark(mark) {
                deps[i].push(j);
            }
        };
        match event {
            Event::Commit(commit) => {
                for parent in commit.parent_marks() {
                    wants(parent);
                }
                for op in &commit.fileops {
                    if let Some(blob) = op.blob_mark() {
                        wants(blob);
                    }
                }
            }
            Event::Tag(tag) => {
                if let Some(mark) = tag.committish.mark() {
                    wants(mark);
                }
            }
            Event::Reset(reset) => {
                if let Some(mark) = reset.committish.as_ref().and_then(Committish::mark) {
                    wants(mark);
                }
            }
            _ => {}
        }
    }
    let mut blocked: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, ds) in deps.iter().enumerate() {
        for &d in ds {
            dependents[d].push(i);
        }
    }
    // Min-heap on original index preserves existing order where possible.
    let mut ready: BTreeSet<usize> = blocked
        .iter()
        .enumerate()
        .filter(|&(_, &b)| b == 0)
        .map(|(i, _)| i)
        .collect();
    let mut order: Vec<usize> = Vec::with_capacity(n);
    while let Some(&next) = ready.iter().next() {
        ready.remove(&next);
        order.push(next);
        for &dependent in &dependents[next] {
            blocked[dependent] -= 1;
            if blocked[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }
    if order.len() != n {
        return Err(command_error(
            "resort detected a reference cycle; event order unchanged",
        ));
    }
    if order.iter().enumerate().all(|(new, &old)| new == old) {
        return Ok(());
    }
    let old_to_new: HashMap<usize, usize> = order
        .iter()
        .enumerate()
        .map(|(new, &old)| (old, new))
        .collect();
    let mut slots: Vec<Option<Event>> = repo.events.drain(..).map(Some).collect();
    repo.events = order
        .iter()
        .map(|&old| slots[old].take().unwrap())
        .collect();
    for assignment in repo.assignments.values_mut() {
        *assignment = assignment.remapped(&old_to_new);
    }
    repo.declare_sequence_mutation();
    Ok(())
}

// --- Renumber -------------------------------------------------------------

/// Rewrites marks to a dense 1-origin sequence in event order, updating
/// every mark reference, and strips duplicate trailing `done` passthroughs.
pub fn renumber(repo: &mut Repository) {
    let mut mapping: HashMap<String, String> = HashMap::new();
    let mut next = 1u64;
    for event in &repo.events {
        if let Some(mark) = event.mark() {
            mapping.insert(mark.to_owned(), format!(":{next}"));
            next += 1;
        }
    }
    let remap = |committish: &mut Committish| {
        if let Committish::Mark(mark) = committish
            && let Some(new) = mapping.get(mark)
        {
            *mark = new.clone();
        }
    };
    for event in &mut repo.events {
        match event {
            Event::Blob(blob) => {
                blob.mark = mapping[&blob.mark].clone();
            }
            Event::Commit(commit) => {
                if let Some(mark) = &commit.mark {
                    commit.mark = Some(mapping[mark].clone());
                }
                for parent in &mut commit.parents {
                    remap(parent);
                }
                for child in &mut commit.children {
                    if let Some(new) = mapping.get(child) {
                        *child = new.clone();
                    }
                }
                for op in &mut commit.fileops {
                    match op {
                        FileOp::Modify { blobref, .. } | FileOp::Note { blobref, .. } => {
                            if let crate::event::BlobRef::Mark(mark) = blobref
                                && let Some(new) = mapping.get(mark)
                            {
                                *mark = new.clone();
                            }
                        }
                        _ => {}
                    }
                }
            }
            Event::Tag(tag) => remap(&mut tag.committish),
            Event::Reset(reset) => {
                if let Some(committish) = &mut reset.committish {
                    remap(committish);
                }
            }
            _ => {}
        }
    }
    for (_, mark) in repo.legacy_map.iter_mut() {
        if let Some(new) = mapping.get(mark) {
            *mark = new.clone();
        }
    }
    // Drop all but the last trailing `done`.
    while repo.events.len() >= 2 {
        let len = repo.events.len();
        let is_done = |e: &Event| {
            matches!(e, Event::Passthrough(p) if p.text.as_slice() == b"done")
        };
        if is_done(&repo.events[len - 1]) && is_done(&repo.events[len - 2]) {
            repo.events.pop();
        } else {
            break;
        }
    }
    repo.declare_sequence_mutation();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadOptions;
    use crate::event::BlobRef;
    use crate::event::MODE_NORMAL;
    use crate::importer::read_stream_bytes;
    use pretty_assertions::assert_eq;

    fn m(path: &str) -> FileOp {
        FileOp::modify(MODE_NORMAL, ":9", path)
    }

    fn d(path: &str) -> FileOp {
        FileOp::delete(path)
    }

    fn r(source: &str, target: &str) -> FileOp {
        FileOp::Rename {
            source: source.into(),
            target: target.into(),
        }
    }

    fn c(source: &str, target: &str) -> FileOp {
        FileOp::Copy {
            source: source.into(),
            target: target.into(),
        }
    }

    fn canon(ops: Vec<FileOp>, preexisting: &[&str]) -> (Vec<FileOp>, CaseCoverage) {
        let pre: Vec<bstr::BString> = preexisting.iter().map(|p| (*p).into()).collect();
        let mut coverage = CaseCoverage::new();
        let mut warnings = Vec::new();
        let result = canonicalize_fileops(
            ops,
            &|path| pre.iter().any(|p| p.as_bstr() == path),
            false,
            &mut coverage,
            &mut warnings,
        );
        (result, coverage)
    }

    #[rstest::rstest]
    #[case::create_then_delete_annihilates(vec![m("a"), d("a")], &[], vec![], 1)]
    #[case::modify_then_delete_keeps_delete(vec![m("a"), d("a")], &["a"], vec![d("a")], 2)]
    #[case::create_then_rename_collapses(vec![m("a"), r("a", "b")], &[], vec![m("b")], 4)]
    #[case::modify_then_rename_swaps(vec![m("a"), r("a", "b")], &["a"], vec![m("b"), r("a", "b")], 3)]
    #[case::delete_then_modify_drops_delete(vec![d("a"), m("a")], &["a"], vec![m("a")], 6)]
    #[case::double_delete(vec![d("a"), d("a")], &["a"], vec![d("a")], -2)]
    #[case::rename_then_delete_target(vec![r("a", "b"), d("b")], &["a"], vec![d("a")], 9)]
    #[case::rename_chain_fuses(vec![r("a", "b"), r("b", "c")], &["a"], vec![r("a", "c")], 11)]
    #[case::copy_then_delete_source_demotes(vec![c("a", "b"), d("a")], &["a"], vec![r("a", "b")], 13)]
    #[case::copy_then_delete_target_annihilates(vec![c("a", "b"), d("b")], &["a"], vec![], 14)]
    #[case::copy_then_rename_fuses(vec![c("a", "b"), r("b", "c")], &["a"], vec![c("a", "c")], 16)]
    fn test_composition_table(
        #[case] ops: Vec<FileOp>,
        #[case] preexisting: &[&str],
        #[case] expected: Vec<FileOp>,
        #[case] case_number: i32,
    ) {
        let (result, coverage) = canon(ops, preexisting);
        assert_eq!(result, expected);
        assert!(coverage.contains(&case_number));
    }

    #[test]
    fn test_deleteall_truncates_left() {
        let (ops, _) = canon(vec![m("a"), m("b"), FileOp::DeleteAll, m("c")], &[]);
        assert_eq!(ops, vec![FileOp::DeleteAll, m("c")]);
    }

    #[test]
    fn test_sort_order() {
        let mut ops = vec![r("x", "y"), m("a"), m("a/b/c"), m("a/b")];
        sort_fileops(&mut ops);
        assert_eq!(ops, vec![m("a/b/c"), m("a/b"), m("a"), r("x", "y")]);
    }

    #[test]
    fn test_coalesce_keeps_last_modify() {
        let one = FileOp::Modify {
            mode: MODE_NORMAL.to_owned(),
            blobref: BlobRef::Mark(":1".to_owned()),
            path: "a".into(),
        };
        let two = FileOp::Modify {
            mode: MODE_NORMAL.to_owned(),
            blobref: BlobRef::Mark(":2".to_owned()),
            path: "a".into(),
        };
        let mut coverage = CaseCoverage::new();
        let mut warnings = Vec::new();
        let ops = canonicalize_fileops(
            vec![one, two.clone()],
            &|_| true,
            true,
            &mut coverage,
            &mut warnings,
        );
        assert_eq!(ops, vec![two]);
    }

    #[test]
    fn test_canonicalize_idempotent() {
        let ops = vec![m("a"), d("a"), c("x", "y"), d("x"), m("q/r"), m("q")];
        let (once, _) = canon(ops, &["x"]);
        let (twice, _) = canon(once.clone(), &["x"]);
        assert_eq!(once, twice);
    }

    const CHAIN: &str = "\
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

    fn chain_repo() -> Repository {
        read_stream_bytes(CHAIN.as_bytes(), "test", &ReadOptions::default()).unwrap()
    }

    #[test]
    fn test_squash_delete_tagify_scenario() {
        let mut repo = chain_repo();
        let index = repo.find_mark(":2").unwrap();
        let selection: OrderedIntSet = [index].into_iter().collect();
        let policy = SquashPolicy::from_flags(["--delete", "--tagify"]).unwrap();
        squash(&mut repo, &selection, &policy).unwrap();
        renumber(&mut repo);
        let commits: Vec<&Commit> = repo
            .events
            .iter()
            .filter_map(Event::as_commit)
            .collect();
        assert_eq!(commits.len(), 1);
        assert!(commits[0].parents.is_empty());
        let tags: Vec<&Tag> = repo.events.iter().filter_map(Event::as_tag).collect();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].name, "emptycommit-mark2");
        // With a parentless target the tag attaches to the old first child,
        // the sole remaining commit.
        assert_eq!(tags[0].committish, Committish::Mark(":2".to_owned()));
        // Under --tagify the blob survives the deletion.
        let blobs = repo.events.iter().filter(|e| e.kind() == "blob").count();
        assert_eq!(blobs, 1);
    }

    #[test]
    fn test_squash_pushforward_moves_ops() {
        let mut repo = chain_repo();
        let index = repo.find_mark(":2").unwrap();
        let selection: OrderedIntSet = [index].into_iter().collect();
        let policy = SquashPolicy::from_flags([]).unwrap();
        squash(&mut repo, &selection, &policy).unwrap();
        let survivor = repo.commit_by_mark(":3").unwrap();
        assert!(survivor.parents.is_empty());
        // The pushed-forward create/delete pair composes away during the
        // post-squash canonicalization, and the survivor's manifest is
        // unchanged (README was deleted there all along).
        assert!(survivor.fileops.is_empty());
        assert!(repo.manifest(":3").unwrap().is_empty());
    }

    #[test]
    fn test_squash_pushback_moves_ops_and_blobs() {
        let stream = "\
commit refs/heads/master
mark :1
committer A <a@x> 1600000000 +0000
data 2
a

blob
mark :2
data 2
x

commit refs/heads/master
mark :3
committer A <a@x> 1600000100 +0000
data 2
b
from :1
M 100644 :2 f
";
        let mut repo =
            read_stream_bytes(stream.as_bytes(), "test", &ReadOptions::default()).unwrap();
        let index = repo.find_mark(":3").unwrap();
        let selection: OrderedIntSet = [index].into_iter().collect();
        let policy = SquashPolicy::from_flags(["--pushback"]).unwrap();
        squash(&mut repo, &selection, &policy).unwrap();
        let survivor = repo.commit_by_mark(":1").unwrap();
        assert_eq!(survivor.fileops.len(), 1);
        // The blob now precedes the receiving commit.
        let blob_index = repo.find_mark(":2").unwrap();
        let commit_index = repo.find_mark(":1").unwrap();
        assert!(blob_index < commit_index);
        assert!(repo.check_invariants().is_empty());
    }

    #[test]
    fn test_squash_empty_selection_is_noop() {
        let mut repo = chain_repo();
        let before: Vec<String> = repo
            .events
            .iter()
            .map(|e| format!("{:?}", e.mark()))
            .collect();
        let policy = SquashPolicy::from_flags([]).unwrap();
        squash(&mut repo, &OrderedIntSet::new(), &policy).unwrap();
        let after: Vec<String> = repo
            .events
            .iter()
            .map(|e| format!("{:?}", e.mark()))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_squash_rejects_non_commit() {
        let mut repo = chain_repo();
        let selection: OrderedIntSet = [0].into_iter().collect();
        let policy = SquashPolicy::from_flags([]).unwrap();
        let err = squash(&mut repo, &selection, &policy).unwrap_err();
        assert!(crate::error::is_recoverable(&err));
    }

    #[test]
    fn test_tagify_empty_skips_nonempty() {
        let mut repo = chain_repo();
        let converted = tagify_empty(&mut repo, None, false, false, None).unwrap();
        assert_eq!(converted, 0);
    }

    #[test]
    fn test_reparent_preserves_tree() {
        let mut repo = chain_repo();
        let index = repo.find_mark(":3").unwrap();
        reparent(&mut repo, index, vec![], false).unwrap();
        let commit = repo.commit_by_mark(":3").unwrap();
        assert!(commit.parents.is_empty());
        assert!(commit.fileops[0].is_deleteall());
        // Old manifest was empty (README deleted), so only the deleteall.
        assert_eq!(commit.fileops.len(), 1);
        let manifest = repo.manifest(":3").unwrap();
        assert!(manifest.is_empty());
    }

    #[test]
    fn test_resort_sorted_is_stable() {
        let mut repo = chain_repo();
        let before: Vec<Option<String>> = repo
            .events
            .iter()
            .map(|e| e.mark().map(str::to_owned))
            .collect();
        resort(&mut repo).unwrap();
        let after: Vec<Option<String>> = repo
            .events
            .iter()
            .map(|e| e.mark().map(str::to_owned))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_resort_moves_late_blob() {
        let mut repo = chain_repo();
        // Move the blob to the end, violating invariant 6.
        let blob = repo.events.remove(0);
        repo.events.push(blob);
        repo.declare_sequence_mutation();
        resort(&mut repo).unwrap();
        assert!(repo.check_invariants().is_empty());
        assert_eq!(repo.events[0].kind(), "blob");
    }

    #[test]
    fn test_renumber_dense() {
        let stream = "\
blob
mark :5
data 2
x

commit refs/heads/master
mark :9
committer A <a@x> 1600000000 +0000
data 2
a
M 100644 :5 f
";
        let mut repo =
            read_stream_bytes(stream.as_bytes(), "test", &ReadOptions::default()).unwrap();
        renumber(&mut repo);
        assert!(repo.find_mark(":1").is_some());
        assert!(repo.find_mark(":2").is_some());
        assert!(repo.find_mark(":5").is_none());
        let commit = repo.commit_by_mark(":2").unwrap();
        assert_eq!(commit.fileops[0].blob_mark(), Some(":1"));
        assert!(repo.check_invariants().is_empty());
    }

    #[test]
    fn test_renumber_involution() {
        let mut repo = chain_repo();
        renumber(&mut repo);
        let once: Vec<Option<String>> = repo
            .events
            .iter()
            .map(|e| e.mark().map(str::to_owned))
            .collect();
        renumber(&mut repo);
        let twice: Vec<Option<String>> = repo
            .events
            .iter()
            .map(|e| e.mark().map(str::to_owned))
            .collect();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_renumber_strips_duplicate_done() {
        let mut repo = chain_repo();
        for _ in 0..2 {
            repo.events.push(Event::Passthrough(crate::event::Passthrough {
                text: "done".into(),
            }));
        }
        renumber(&mut repo);
        let dones = repo
            .events
            .iter()
            .filter(
                |e| matches!(e, Event::Passthrough(p) if p.text.as_slice() == b"done"),
            )
            .count();
        assert_eq!(dones, 1);
    }
}
