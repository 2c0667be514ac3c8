use crate::error::command_error;
use crate::event::Commit;
use crate::event::Committish;
use crate::event::Event;
use crate::event::FileOp;
use crate::orderedset::OrderedIntSet;
use crate::repository::Repository;
use anyhow::Context as _;
use anyhow::Result;
use bstr::BString;
use bstr::ByteSlice as _;
use std::collections::HashMap;
use std::collections::HashSet;

/// Where to cut a commit's fileop list in two.
#[derive(Debug, Clone)]
pub enum SplitSpec {
    /// Ops before the index stay, ops from the index on move to the clone.
    AtIndex(usize),
    /// Ops under the path prefix move to the clone.
    ByPrefix(BString),
}

/// Splits the commit at `index` into two: the original keeps the first
/// partition of fileops, a clone inserted right after it takes the second
/// and becomes its child. The clone's legacy ID gains a `.split` suffix.
/// Both partitions must be non-empty.
pub fn split_commit(repo: &mut Repository, index: usize, spec: &SplitSpec) -> Result<()> {
    let commit = repo
        .commit_at(index)
        .ok_or_else(|| command_error(format!("event {index} is not a commit")))?
        .clone();
    let mark = commit
        .mark
        .clone()
        .ok_or_else(|| command_error("cannot split an unmarked commit"))?;
    let (keep, moved): (Vec<FileOp>, Vec<FileOp>) = match spec {
        SplitSpec::AtIndex(at) => {
            if *at == 0 || *at >= commit.fileops.len() {
                return Err(command_error(format!(
                    "split index {at} does not properly partition {} fileops",
                    commit.fileops.len()
                )));
            }
            let mut keep = commit.fileops.clone();
            let moved = keep.split_off(*at);
            (keep, moved)
        }
        SplitSpec::ByPrefix(prefix) => {
            let matches = |op: &FileOp| {
                op.paths().iter().any(|p| {
                    p.starts_with(prefix.as_slice())
                        && (p.len() == prefix.len() || p.get(prefix.len()) == Some(&b'/'))
                })
            };
            let keep: Vec<FileOp> = commit
                .fileops
                .iter()
                .filter(|op| !matches(op))
                .cloned()
                .collect();
            let moved: Vec<FileOp> = commit
                .fileops
                .iter()
                .filter(|op| matches(op))
                .cloned()
                .collect();
            (keep, moved)
        }
    };
    if keep.is_empty() || moved.is_empty() {
        return Err(command_error(
            "split must leave fileops on both sides of the cut",
        ));
    }
    let clone_mark = repo.new_mark();
    let mut clone = commit.clone();
    clone.mark = Some(clone_mark.clone());
    clone.fileops = moved;
    clone.parents = vec![Committish::Mark(mark.clone())];
    clone.children = commit.children.clone();
    clone.legacy_id = commit.legacy_id.as_ref().map(|id| format!("{id}.split"));

    // The original's former children now descend from the clone.
    let child_marks = commit.children.clone();
    repo.commit_mut_at(index).unwrap().fileops = keep;
    repo.events.insert(index + 1, Event::Commit(clone));
    repo.declare_sequence_mutation();
    for child in child_marks {
        let child_index = repo.find_mark(&child).context("child vanished during split")?;
        let child_commit = repo.commit_at(child_index).unwrap();
        let parents = child_commit
            .parents
            .iter()
            .map(|p| {
                if p.mark() == Some(mark.as_str()) {
                    Committish::Mark(clone_mark.clone())
                } else {
                    p.clone()
                }
            })
            .collect();
        repo.set_parents(child_index, parents)?;
    }
    repo.rebuild_children();
    Ok(())
}

/// Remaps every mark in `repo` by adding `offset` to its numeric part.
fn offset_marks(repo: &mut Repository, offset: u64) {
    let shift = |mark: &mut String| {
        if let Some(n) = mark.strip_prefix(':').and_then(|d| d.parse::<u64>().ok()) {
            *mark = format!(":{}", n + offset);
        }
    };
    for event in &mut repo.events {
        match event {
            Event::Blob(blob) => shift(&mut blob.mark),
            Event::Commit(commit) => {
                if let Some(mark) = &mut commit.mark {
                    shift(mark);
                }
                for parent in &mut commit.parents {
                    if let Committish::Mark(mark) = parent {
                        shift(mark);
                    }
                }
                for child in &mut commit.children {
                    shift(child);
                }
                for op in &mut commit.fileops {
                    if let FileOp::Modify { blobref, .. } | FileOp::Note { blobref, .. } = op
                        && let crate::event::BlobRef::Mark(mark) = blobref
                    {
                        shift(mark);
                    }
                }
            }
            Event::Tag(tag) => {
                if let Committish::Mark(mark) = &mut tag.committish {
                    shift(mark);
                }
            }
            Event::Reset(reset) => {
                if let Some(Committish::Mark(mark)) = &mut reset.committish {
                    shift(mark);
                }
            }
            _ => {}
        }
    }
    for mark in repo.legacy_map.values_mut() {
        shift(mark);
    }
    repo.declare_sequence_mutation();
}

fn max_mark_number(repo: &Repository) -> u64 {
    repo.events
        .iter()
        .filter_map(Event::mark)
        .filter_map(|m| m.trim_start_matches(':').parse::<u64>().ok())
        .max()
        .unwrap_or(0)
}

/// Merges repositories into one. Colliding branch and tag names are
/// uniquified with repo-name suffixes; each non-oldest repository's root
/// commits become children of the latest earlier commit by time.
pub fn unite(mut repos: Vec<Repository>) -> Result<Repository> {
    if repos.is_empty() {
        return Err(command_error("unite requires at least one repository"));
    }
    // Oldest repository (by earliest commit date) anchors the timeline.
    repos.sort_by_key(|repo| {
        repo.events
            .iter()
            .filter_map(Event::as_commit)
            .map(|c| c.committer.date.timestamp())
            .min()
            .unwrap_or(i64::MAX)
    });
    let mut combined = repos.remove(0);
    combined.name = format!("{}+united", combined.name);
    for mut incoming in repos {
        // The incoming repository's source handle and scratch directory die
        // with it, so its blobs must come along in memory.
        incoming.internalize_blobs()?;
        let offset = max_mark_number(&combined);
        offset_marks(&mut incoming, offset);

        // Uniquify colliding branch and tag names.
        let existing_branches: HashSet<String> =
            combined.branches().iter().map(str::to_owned).collect();
        let existing_tags: HashSet<String> = combined
            .events
            .iter()
            .filter_map(Event::as_tag)
            .map(|t| t.name.clone())
            .collect();
        let suffix = incoming.name.clone();
        for event in &mut incoming.events {
            match event {
                Event::Commit(commit) if existing_branches.contains(&commit.branch) => {
                    commit.branch = format!("{}-{}", commit.branch, suffix);
                }
                Event::Reset(reset) if existing_branches.contains(&reset.ref_name) => {
                    reset.ref_name = format!("{}-{}", reset.ref_name, suffix);
                }
                Event::Tag(tag) if existing_tags.contains(&tag.name) => {
                    tag.name = format!("{}-{}", tag.name, suffix);
                }
                _ => {}
            }
        }

        // Graft each incoming root under the latest prior commit by time.
        let mut root_marks: Vec<(String, i64)> = incoming
            .events
            .iter()
            .filter_map(Event::as_commit)
            .filter(|c| c.parents.is_empty())
            .filter_map(|c| c.mark.clone().map(|m| (m, c.committer.date.timestamp())))
            .collect();
        let host_commits: Vec<(String, i64)> = combined
            .events
            .iter()
            .filter_map(Event::as_commit)
            .filter_map(|c| c.mark.clone().map(|m| (m, c.committer.date.timestamp())))
            .collect();
        for event in incoming.events.drain(..) {
            combined.events.push(event);
        }
        combined.declare_sequence_mutation();
        for (root, date) in root_marks.drain(..) {
            let anchor = host_commits
                .iter()
                .filter(|(_, host_date)| *host_date <= date)
                .max_by_key(|(_, host_date)| *host_date)
                .map(|(mark, _)| mark.clone());
            if let Some(anchor) = anchor {
                let index = combined.find_mark(&root).context("root vanished")?;
                combined.set_parents(index, vec![Committish::Mark(anchor)])?;
            }
        }
        for (legacy, mark) in incoming.legacy_map.drain() {
            combined.legacy_map.entry(legacy).or_insert(mark);
        }
    }
    combined.rebuild_children();
    crate::surgery::resort(&mut combined)?;
    crate::surgery::renumber(&mut combined);
    Ok(combined)
}

/// Inserts `guest` into `host`, making the guest's root commits children of
/// the host commit at `at_index`. Callout parents in the guest resolve
/// against host commits by action stamp.
pub fn graft(host: &mut Repository, mut guest: Repository, at_index: usize) -> Result<()> {
    let anchor_mark = host
        .commit_at(at_index)
        .and_then(|c| c.mark.clone())
        .ok_or_else(|| command_error(format!("graft point {at_index} is not a marked commit")))?;
    guest.internalize_blobs()?;
    let offset = max_mark_number(host);
    offset_marks(&mut guest, offset);

    // Resolve callouts by action stamp.
    let stamps: HashMap<String, String> = host
        .events
        .iter()
        .filter_map(Event::as_commit)
        .filter_map(|c| c.mark.clone().map(|m| (c.action_stamp(), m)))
        .collect();
    for event in &mut guest.events {
        let Some(commit) = event.as_commit_mut() else {
            continue;
        };
        for parent in &mut commit.parents {
            if let Committish::Callout(stamp) = parent
                && let Some(mark) = stamps.get(stamp.as_str())
            {
                *parent = Committish::Mark(mark.clone());
            }
        }
    }

    let roots: Vec<String> = guest
        .events
        .iter()
        .filter_map(Event::as_commit)
        .filter(|c| c.parents.is_empty())
        .filter_map(|c| c.mark.clone())
        .collect();
    for event in guest.events.drain(..) {
        host.events.push(event);
    }
    host.declare_sequence_mutation();
    for root in roots {
        let index = host.find_mark(&root).context("guest root vanished")?;
        host.set_parents(index, vec![Committish::Mark(anchor_mark.clone())])?;
    }
    for (legacy, mark) in guest.legacy_map.drain() {
        host.legacy_map.entry(legacy).or_insert(mark);
    }
    host.rebuild_children();
    crate::surgery::resort(host)?;
    Ok(())
}

/// Result of a divide attempt.
#[derive(Debug)]
pub enum DivideOutcome {
    /// The cut separated the graph into an early and a late repository.
    Split(Repository, Repository),
    /// The graph stayed connected; branch segments were renamed in place
    /// instead.
    Renamed(Repository),
}

/// Attempts a topological cut between two adjacent commits: `late` loses
/// its parent link to `early`, and if the remaining graph two-colors
/// cleanly the repository divides into `-early` and `-late` halves. The
/// late half references the severed parent through a callout.
pub fn divide(mut repo: Repository, early_index: usize, late_index: usize) -> Result<DivideOutcome> {
    // Both halves outlive the original repository and its blob storage.
    repo.internalize_blobs()?;
    let early_mark = repo
        .commit_at(early_index)
        .and_then(|c| c.mark.clone())
        .ok_or_else(|| command_error(format!("event {early_index} is not a marked commit")))?;
    let late = repo
        .commit_at(late_index)
        .ok_or_else(|| command_error(format!("event {late_index} is not a commit")))?;
    if !late.has_parent_mark(&early_mark) {
        return Err(command_error("divide requires a parent-child link"));
    }
    let early_stamp = repo.commit_at(early_index).unwrap().action_stamp();

    // Sever the link, then two-color by undirected reachability.
    let late_mark = late.mark.clone().context("late commit has no mark")?;
    let late_parents: Vec<Committish> = repo
        .commit_at(late_index)
        .unwrap()
        .parents
        .iter()
        .map(|p| {
            if p.mark() == Some(early_mark.as_str()) {
                Committish::Callout(early_stamp.clone())
            } else {
                p.clone()
            }
        })
        .collect();
    repo.set_parents(late_index, late_parents)?;
    repo.rebuild_children();

    let component = |repo: &Repository, seed: &str| -> HashSet<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue = vec![seed.to_owned()];
        while let Some(mark) = queue.pop() {
            if !seen.insert(mark.clone()) {
                continue;
            }
            if let Some(commit) = repo.commit_by_mark(&mark) {
                queue.extend(commit.parent_marks().into_iter().map(str::to_owned));
                queue.extend(commit.children.iter().cloned());
            }
        }
        seen
    };
    let early_set = component(&repo, &early_mark);
    let late_set = component(&repo, &late_mark);
    if early_set.contains(&late_mark) || late_set.contains(&early_mark) {
        // Still connected through another path: rename segments instead.
        let branch = repo.commit_at(late_index).unwrap().branch.clone();
        for (i, event) in repo.events.iter_mut().enumerate() {
            if let Event::Commit(commit) = event
                && commit.branch == branch
                && i <= early_index
            {
                commit.branch = format!("{branch}-early");
            }
        }
        repo.declare_sequence_mutation();
        return Ok(DivideOutcome::Renamed(repo));
    }

    // Partition events by color. A blob referenced on both sides is
    // duplicated; tags and resets follow their targets; passthroughs stay
    // early.
    let mut blob_early: HashSet<String> = HashSet::new();
    let mut blob_late: HashSet<String> = HashSet::new();
    for event in &repo.events {
        let Some(commit) = event.as_commit() else {
            continue;
        };
        let Some(mark) = commit.mark.as_deref() else {
            continue;
        };
        let side = if late_set.contains(mark) {
            &mut blob_late
        } else {
            &mut blob_early
        };
        for op in &commit.fileops {
            if let Some(blob) = op.blob_mark() {
                side.insert(blob.to_owned());
            }
        }
    }
    let target_color = |committish: Option<&str>| -> bool {
        committish.is_some_and(|m| late_set.contains(m))
    };
    let mut early_repo = Repository::new(format!("{}-early", repo.name));
    let mut late_repo = Repository::new(format!("{}-late", repo.name));
    early_repo.sourcetype = repo.sourcetype.clone();
    late_repo.sourcetype = repo.sourcetype.clone();
    for event in repo.events.drain(..) {
        if let Event::Blob(blob) = &event {
            if blob_late.contains(&blob.mark) {
                late_repo.events.push(event.clone());
            }
            if blob_early.contains(&blob.mark) || !blob_late.contains(&blob.mark) {
                early_repo.events.push(event);
            }
            continue;
        }
        let goes_late = match &event {
            Event::Commit(commit) => commit
                .mark
                .as_deref()
                .is_some_and(|m| late_set.contains(m)),
            Event::Tag(tag) => target_color(tag.committish.mark()),
            Event::Reset(reset) => {
                target_color(reset.committish.as_ref().and_then(Committish::mark))
            }
            _ => false,
        };
        if goes_late {
            late_repo.events.push(event);
        } else {
            early_repo.events.push(event);
        }
    }
    for repo in [&mut early_repo, &mut late_repo] {
        repo.rebuild_children();
        crate::surgery::renumber(repo);
    }
    Ok(DivideOutcome::Split(early_repo, late_repo))
}

/// Relocates one branch's history into a subdirectory of another branch,
/// merging the timelines and rewriting fileop paths under the source
/// branch's basename.
pub fn debranch(repo: &mut Repository, source: &str, target: &str) -> Result<()> {
    if repo.branch_tip(source).is_none() {
        return Err(command_error(format!("no commits on branch {source}")));
    }
    if repo.branch_tip(target).is_none() {
        return Err(command_error(format!("no commits on branch {target}")));
    }
    let subdir: BString = source
        .rsplit('/')
        .next()
        .unwrap_or(source)
        .as_bytes()
        .into();
    let mut source_roots: Vec<(String, i64)> = Vec::new();
    for event in &mut repo.events {
        let Some(commit) = event.as_commit_mut() else {
            continue;
        };
        if commit.branch != source {
            continue;
        }
        for op in &mut commit.fileops {
            let prefix_path = |path: &mut BString| {
                let mut new_path = subdir.clone();
                new_path.push(b'/');
                new_path.extend_from_slice(path);
                *path = new_path;
            };
            match op {
                FileOp::Modify { path, .. }
                | FileOp::Delete { path }
                | FileOp::Note { path, .. } => prefix_path(path),
                FileOp::Rename { source, target } | FileOp::Copy { source, target } => {
                    prefix_path(source);
                    prefix_path(target);
                }
                FileOp::DeleteAll => {}
            }
        }
        if commit.parents.is_empty()
            && let Some(mark) = commit.mark.clone()
        {
            source_roots.push((mark, commit.committer.date.timestamp()));
        }
        commit.branch = target.to_owned();
    }
    repo.declare_sequence_mutation();
    // Stitch source roots into the target timeline.
    let target_commits: Vec<(String, i64)> = repo
        .events
        .iter()
        .filter_map(Event::as_commit)
        .filter(|c| c.branch == target)
        .filter_map(|c| c.mark.clone().map(|m| (m, c.committer.date.timestamp())))
        .collect();
    for (root, date) in source_roots {
        let anchor = target_commits
            .iter()
            .filter(|(mark, host_date)| *host_date <= date && *mark != root)
            .max_by_key(|(_, host_date)| *host_date)
            .map(|(mark, _)| mark.clone());
        if let Some(anchor) = anchor {
            let index = repo.find_mark(&root).context("debranch root vanished")?;
            repo.set_parents(index, vec![Committish::Mark(anchor)])?;
        }
    }
    repo.rebuild_children();
    // Drop resets that still point into the removed branch namespace.
    repo.events.retain(|event| match event {
        Event::Reset(reset) => reset.ref_name != source,
        _ => true,
    });
    repo.declare_sequence_mutation();
    Ok(())
}

/// Regex-substitutes paths in every fileop of the selected commits. Without
/// `force`, refuses when a new path is already visible in the commit's
/// ancestry or already present in the same commit.
pub fn path_rename(
    repo: &mut Repository,
    selection: &OrderedIntSet,
    pattern: &regex::bytes::Regex,
    replacement: &str,
    force: bool,
) -> Result<()> {
    // Validate before mutating.
    let mut planned: Vec<(usize, Vec<FileOp>)> = Vec::new();
    for index in selection.iter() {
        let Some(commit) = repo.commit_at(index) else {
            continue;
        };
        let mut new_ops = commit.fileops.clone();
        let mut touched = false;
        for op in &mut new_ops {
            let rename = |path: &mut BString, touched: &mut bool| {
                let new_path = pattern.replace(path.as_slice(), replacement.as_bytes());
                if new_path.as_ref() != path.as_slice() {
                    *path = BString::from(new_path.into_owned());
                    *touched = true;
                }
            };
            match op {
                FileOp::Modify { path, .. }
                | FileOp::Delete { path }
                | FileOp::Note { path, .. } => rename(path, &mut touched),
                FileOp::Rename { source, target } | FileOp::Copy { source, target } => {
                    rename(source, &mut touched);
                    rename(target, &mut touched);
                }
                FileOp::DeleteAll => {}
            }
        }
        if !touched {
            continue;
        }
        if !force {
            let old_paths: HashSet<BString> = commit
                .fileops
                .iter()
                .flat_map(|op| op.paths())
                .map(|p| p.to_owned())
                .collect();
            for op in &new_ops {
                for path in op.paths() {
                    if old_paths.contains(path.as_bytes().as_bstr()) {
                        continue;
                    }
                    if repo.visible(index, path).is_some() {
                        return Err(command_error(format!(
                            "rename target {path:?} already visible in ancestry of event {index}; use --force to override"
                        )));
                    }
                    let count = new_ops
                        .iter()
                        .flat_map(|o| o.paths())
                        .filter(|p| *p == path)
                        .count();
                    if count > 1 {
                        return Err(command_error(format!(
                            "rename collides on {path:?} within one commit"
                        )));
                    }
                }
            }
        }
        planned.push((index, new_ops));
    }
    for (index, new_ops) in planned {
        let mark = {
            let commit = repo.commit_mut_at(index).unwrap();
            commit.fileops = new_ops;
            commit.mark.clone()
        };
        if let Some(mark) = mark {
            repo.invalidate_manifests_from(&mark);
        }
    }
    Ok(())
}

/// Removes fileops with matching paths from the selected commits, following
/// renames forward so a file that moves keeps being expunged. Returns a
/// sibling repository holding the removed history so the operation is
/// reversible.
pub fn expunge(
    repo: &mut Repository,
    selection: &OrderedIntSet,
    patterns: &[regex::bytes::Regex],
) -> Result<Repository> {
    repo.internalize_blobs()?;
    let mut expunged = Repository::new(format!("{}-expunges", repo.name));
    expunged.sourcetype = repo.sourcetype.clone();
    // Paths pulled into the expunge set by renames of matching paths.
    let mut tracked: HashSet<BString> = HashSet::new();
    let matches = |path: &bstr::BStr, tracked: &HashSet<BString>| {
        tracked.contains(path.as_bytes()) || patterns.iter().any(|p| p.is_match(path))
    };
    let mut removed_blob_marks: HashSet<String> = HashSet::new();
    let mut kept_blob_marks: HashSet<String> = HashSet::new();
    let mut indices: Vec<usize> = selection.iter().collect();
    indices.sort_unstable();
    let selected: HashSet<usize> = indices.iter().copied().collect();

    for index in indices {
        let Some(commit) = repo.commit_at(index) else {
            continue;
        };
        let mut keep: Vec<FileOp> = Vec::new();
        let mut remove: Vec<FileOp> = Vec::new();
        for op in &commit.fileops {
            let is_match = match op {
                FileOp::Rename { source, target } | FileOp::Copy { source, target } => {
                    let source_hit = matches(source.as_bstr(), &tracked);
                    if source_hit {
                        // The file continues under its new name.
                        tracked.insert(target.clone());
                    }
                    source_hit || matches(target.as_bstr(), &tracked)
                }
                FileOp::DeleteAll => false,
                _ => op
                    .paths()
                    .iter()
                    .any(|p| matches(p, &tracked)),
            };
            if is_match {
                if let Some(mark) = op.blob_mark() {
                    removed_blob_marks.insert(mark.to_owned());
                }
                remove.push(op.clone());
            } else {
                keep.push(op.clone());
            }
        }
        if remove.is_empty() {
            continue;
        }
        let mut shadow = commit.clone();
        shadow.fileops = remove;
        shadow.children = Vec::new();
        // The shadow history keeps only the chain structure among expunged
        // commits.
        let kept_parents: Vec<Committish> = shadow
            .parents
            .iter()
            .filter(|p| {
                p.mark()
                    .and_then(|m| repo.find_mark(m))
                    .is_some_and(|i| selected.contains(&i))
            })
            .cloned()
            .collect();
        shadow.parents = kept_parents;
        expunged.events.push(Event::Commit(shadow));
        repo.commit_mut_at(index).unwrap().fileops = keep;
    }
    // Blobs still referenced on the main side stay there; orphaned ones move.
    for event in &repo.events {
        if let Some(commit) = event.as_commit() {
            for op in &commit.fileops {
                if let Some(mark) = op.blob_mark() {
                    kept_blob_marks.insert(mark.to_owned());
                }
            }
        }
    }
    let mut moved_events = Vec::new();
    repo.events.retain(|event| match event {
        Event::Blob(blob)
            if removed_blob_marks.contains(&blob.mark)
                && !kept_blob_marks.contains(&blob.mark) =>
        {
            moved_events.push(Event::Blob(blob.clone()));
            false
        }
        _ => true,
    });
    // Blobs precede the commits that use them in the sibling repo.
    for event in moved_events.into_iter().rev() {
        expunged.events.insert(0, event);
    }
    // Referenced-but-kept blobs get copied so the sibling is self-contained.
    let copy_marks: Vec<String> = removed_blob_marks
        .intersection(&kept_blob_marks)
        .cloned()
        .collect();
    let mut copies = Vec::new();
    for mark in copy_marks {
        if let Some(blob) = repo.blob_by_mark(&mark) {
            copies.push(Event::Blob(blob.clone()));
        }
    }
    for event in copies.into_iter().rev() {
        expunged.events.insert(0, event);
    }
    repo.declare_sequence_mutation();
    repo.rebuild_children();
    expunged.rebuild_children();
    Ok(expunged)
}
