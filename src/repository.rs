use crate::event::Blob;
use crate::event::BlobBody;
use crate::event::Commit;
use crate::event::Committish;
use crate::event::Event;
use crate::event::FileOp;
use crate::event::Manifest;
use crate::event::ManifestEntry;
use crate::orderedset::OrderedIntSet;
use anyhow::Context as _;
use anyhow::Result;
use anyhow::bail;
use bstr::BStr;
use bstr::BString;
use bstr::ByteSlice as _;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::HashSet;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

/// The in-memory repository: an ordered sequence of events plus the caches
/// and scratch storage hanging off it. The repository exclusively owns its
/// events; dropping it releases the scratch directory.
#[derive(Debug)]
pub struct Repository {
    pub name: String,
    pub events: Vec<Event>,
    /// Hard VCS hint from a `#reposurgeon sourcetype` comment or the reader.
    pub sourcetype: Option<String>,
    /// Map from legacy IDs (e.g. Subversion revisions) to commit marks.
    pub legacy_map: HashMap<String, String>,
    /// Named selection sets assigned by the operator.
    pub assignments: HashMap<String, OrderedIntSet>,
    /// Kept open while blobs reference byte ranges of the source stream.
    pub source_handle: Option<RefCell<std::fs::File>>,
    mark_index: RefCell<Option<HashMap<String, usize>>>,
    manifest_cache: RefCell<HashMap<String, Manifest>>,
    scratch_dir: Option<PathBuf>,
    next_mark: u64,
    /// Gzip spill files instead of writing them raw.
    pub compress_blobs: bool,
}

impl Repository {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Vec::new(),
            sourcetype: None,
            legacy_map: HashMap::new(),
            assignments: HashMap::new(),
            source_handle: None,
            mark_index: RefCell::new(None),
            manifest_cache: RefCell::new(HashMap::new()),
            scratch_dir: None,
            next_mark: 0,
            compress_blobs: false,
        }
    }

    /// Allocates a fresh mark, one past the highest seen so far.
    pub fn new_mark(&mut self) -> String {
        self.next_mark += 1;
        format!(":{}", self.next_mark)
    }

    /// Records an externally assigned mark so that future allocations do not
    /// collide with it.
    pub fn note_mark(&mut self, mark: &str) {
        if let Some(n) = mark
            .strip_prefix(':')
            .and_then(|digits| digits.parse::<u64>().ok())
        {
            self.next_mark = self.next_mark.max(n);
        }
    }

    /// Any structural change that creates, renames or removes events must
    /// call this to drop the mark index and manifest memos.
    pub fn declare_sequence_mutation(&self) {
        *self.mark_index.borrow_mut() = None;
        self.manifest_cache.borrow_mut().clear();
    }

    /// Index of the event carrying `mark`, via the lazily built mark index.
    pub fn find_mark(&self, mark: &str) -> Option<usize> {
        let mut cache = self.mark_index.borrow_mut();
        let index = cache.get_or_insert_with(|| {
            self.events
                .iter()
                .enumerate()
                .filter_map(|(i, event)| event.mark().map(|m| (m.to_owned(), i)))
                .collect()
        });
        index.get(mark).copied()
    }

    pub fn commit_at(&self, index: usize) -> Option<&Commit> {
        self.events.get(index).and_then(Event::as_commit)
    }

    pub fn commit_mut_at(&mut self, index: usize) -> Option<&mut Commit> {
        self.events.get_mut(index).and_then(Event::as_commit_mut)
    }

    pub fn commit_by_mark(&self, mark: &str) -> Option<&Commit> {
        self.find_mark(mark).and_then(|i| self.commit_at(i))
    }

    pub fn blob_by_mark(&self, mark: &str) -> Option<&Blob> {
        self.find_mark(mark)
            .and_then(|i| self.events.get(i))
            .and_then(Event::as_blob)
    }

    /// Event indices of tags and resets whose committish is `mark` - the
    /// attachment list used for bulk retargeting during squash.
    pub fn attachments(&self, mark: &str) -> Vec<usize> {
        self.events
            .iter()
            .enumerate()
            .filter(|(_, event)| match event {
                Event::Tag(tag) => tag.committish.mark() == Some(mark),
                Event::Reset(reset) => {
                    reset.committish.as_ref().and_then(Committish::mark) == Some(mark)
                }
                _ => false,
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Recomputes every commit's child list from the parent lists. The
    /// parent direction is authoritative.
    pub fn rebuild_children(&mut self) {
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for event in &self.events {
            let Some(commit) = event.as_commit() else {
                continue;
            };
            let Some(mark) = commit.mark.clone() else {
                continue;
            };
            for parent in commit.parent_marks() {
                children.entry(parent.to_owned()).or_default().push(mark.clone());
            }
        }
        for event in &mut self.events {
            let Some(commit) = event.as_commit_mut() else {
                continue;
            };
            let Some(mark) = &commit.mark else {
                commit.children.clear();
                continue;
            };
            commit.children = children.remove(mark.as_str()).unwrap_or_default();
        }
    }

    /// Replaces a commit's parent list, maintaining the reciprocal child
    /// links and invalidating dependent manifests.
    pub fn set_parents(&mut self, index: usize, parents: Vec<Committish>) -> Result<()> {
        let commit = self
            .commit_at(index)
            .with_context(|| format!("event {index} is not a commit"))?;
        let mark = commit.mark.clone();
        let old_parents: Vec<String> = commit
            .parent_marks()
            .into_iter()
            .map(str::to_owned)
            .collect();
        let new_parent_marks: Vec<String> = parents
            .iter()
            .filter_map(|p| p.mark().map(str::to_owned))
            .collect();

        if let Some(mark) = &mark {
            for old in &old_parents {
                if new_parent_marks.contains(old) {
                    continue;
                }
                if let Some(pidx) = self.find_mark(old)
                    && let Some(parent) = self.commit_mut_at(pidx)
                {
                    parent.children.retain(|c| c != mark);
                }
            }
            for new in &new_parent_marks {
                if old_parents.contains(new) {
                    continue;
                }
                if let Some(pidx) = self.find_mark(new)
                    && let Some(parent) = self.commit_mut_at(pidx)
                    && !parent.children.contains(mark)
                {
                    parent.children.push(mark.clone());
                }
            }
        }
        let commit = self.commit_mut_at(index).unwrap();
        commit.parents = parents;
        if let Some(mark) = mark {
            self.invalidate_manifests_from(&mark);
        }
        Ok(())
    }

    /// Drops memoized manifests on the commit and all its descendants with a
    /// single mark-and-sweep pass; each commit is visited once even across
    /// merge fan-ins.
    pub fn invalidate_manifests_from(&self, mark: &str) {
        let mut cache = self.manifest_cache.borrow_mut();
        if cache.is_empty() {
            return;
        }
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue = vec![mark.to_owned()];
        while let Some(mark) = queue.pop() {
            if !seen.insert(mark.clone()) {
                continue;
            }
            cache.remove(&mark);
            if let Some(commit) = self.commit_by_mark(&mark) {
                queue.extend(commit.children.iter().cloned());
            }
        }
    }

    /// The manifest visible after the given commit: its first parent's
    /// manifest with this commit's fileops applied in order. Memoized.
    pub fn manifest(&self, mark: &str) -> Result<Manifest> {
        if let Some(cached) = self.manifest_cache.borrow().get(mark) {
            return Ok(cached.clone());
        }
        // Walk up first parents until a memoized ancestor or a root.
        let mut chain: Vec<String> = Vec::new();
        let mut base = Manifest::new();
        let mut cursor = mark.to_owned();
        loop {
            if let Some(cached) = self.manifest_cache.borrow().get(&cursor) {
                base = cached.clone();
                break;
            }
            let commit = self
                .commit_by_mark(&cursor)
                .with_context(|| format!("no commit with mark {cursor}"))?;
            chain.push(cursor.clone());
            match commit.first_parent_mark() {
                Some(parent) => cursor = parent.to_owned(),
                None => break,
            }
        }
        for link in chain.iter().rev() {
            let commit = self.commit_by_mark(link).unwrap();
            apply_fileops(&mut base, &commit.fileops);
            self.manifest_cache
                .borrow_mut()
                .insert(link.clone(), base.clone());
        }
        Ok(base)
    }

    /// Walks first-parent ancestors of the commit at `index` looking for the
    /// most recent non-deleted touch of `path`. Returns the index of the
    /// touching commit, or None if the path is invisible there.
    pub fn visible(&self, index: usize, path: &BStr) -> Option<usize> {
        let mut cursor = index;
        loop {
            let commit = self.commit_at(cursor)?;
            for op in commit.fileops.iter().rev() {
                match op {
                    FileOp::Modify { path: p, .. } if p.as_bstr() == path => return Some(cursor),
                    FileOp::Copy { target, .. } | FileOp::Rename { target, .. }
                        if target.as_bstr() == path =>
                    {
                        return Some(cursor);
                    }
                    FileOp::Rename { source, .. } if source.as_bstr() == path => return None,
                    FileOp::Delete { path: p } if p.as_bstr() == path => return None,
                    FileOp::DeleteAll => return None,
                    _ => {}
                }
            }
            let parent = commit.first_parent_mark()?;
            cursor = self.find_mark(parent)?;
        }
    }

    /// The blob content associated with `path` in the manifest of the commit
    /// carrying `mark`.
    pub fn blob_by_name(&self, mark: &str, path: &BStr) -> Result<Option<BString>> {
        let manifest = self.manifest(mark)?;
        let Some(entry) = manifest.get(path).cloned() else {
            return Ok(None);
        };
        match entry.blobref {
            crate::event::BlobRef::Inline(data) => Ok(Some(data)),
            crate::event::BlobRef::Mark(blob_mark) => {
                let blob = self
                    .blob_by_mark(&blob_mark)
                    .with_context(|| format!("dangling blob reference {blob_mark}"))?;
                Ok(Some(blob.materialize(self.source_handle.as_ref())?))
            }
        }
    }

    /// All branch names carried by commits and resets, in stream order.
    pub fn branches(&self) -> crate::orderedset::OrderedStringSet {
        let mut out = crate::orderedset::OrderedStringSet::new();
        for event in &self.events {
            match event {
                Event::Commit(commit) => out.push(commit.branch.clone()),
                Event::Reset(reset) => out.push(reset.ref_name.clone()),
                _ => {}
            }
        }
        out
    }

    /// The index of the last commit on `branch`, if any.
    pub fn branch_tip(&self, branch: &str) -> Option<usize> {
        self.events
            .iter()
            .enumerate()
            .rev()
            .find(|(_, event)| {
                event
                    .as_commit()
                    .is_some_and(|commit| commit.branch == branch)
            })
            .map(|(i, _)| i)
    }

    /// Indices of childless commits (heads).
    pub fn heads(&self) -> Vec<usize> {
        self.events
            .iter()
            .enumerate()
            .filter(|(_, event)| {
                event
                    .as_commit()
                    .is_some_and(|commit| commit.children.is_empty())
            })
            .map(|(i, _)| i)
            .collect()
    }

    // --- Scratch directory and blob spill ---------------------------------

    /// The per-repository scratch directory `<cwd>/.rs<pid>-<name>`,
    /// created on first use.
    pub fn scratch_dir(&mut self) -> Result<&Path> {
        if self.scratch_dir.is_none() {
            let dir = std::env::current_dir()?
                .join(format!(".rs{}-{}", std::process::id(), self.name));
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating scratch directory {}", dir.display()))?;
            self.scratch_dir = Some(dir);
        }
        Ok(self.scratch_dir.as_deref().unwrap())
    }

    /// The spill path for a mark: three-level `blobs/NNN/NNN/NNN` fan-out so
    /// no single directory grows too large.
    fn spill_path(scratch: &Path, mark: &str) -> PathBuf {
        let digits: String = mark.chars().filter(char::is_ascii_digit).collect();
        let padded = format!("{digits:0>9}");
        let n = padded.len();
        scratch
            .join("blobs")
            .join(&padded[..n - 6])
            .join(&padded[n - 6..n - 3])
            .join(&padded[n - 3..])
    }

    /// Writes blob content to a spill file and repoints the blob's body at
    /// it, honoring the `compressblobs` option.
    pub fn spill_blob(&mut self, mark: &str, content: &[u8]) -> Result<()> {
        let gzipped = self.compress_blobs;
        let scratch = self.scratch_dir()?.to_path_buf();
        let path = Self::spill_path(&scratch, mark);
        std::fs::create_dir_all(path.parent().unwrap())?;
        let mut file = std::fs::File::create(&path)
            .with_context(|| format!("creating spill file {}", path.display()))?;
        if gzipped {
            let mut encoder =
                flate2::write::GzEncoder::new(&mut file, flate2::Compression::default());
            encoder.write_all(content)?;
            encoder.finish()?;
        } else {
            file.write_all(content)?;
        }
        let index = self
            .find_mark(mark)
            .with_context(|| format!("no event with mark {mark}"))?;
        match &mut self.events[index] {
            Event::Blob(blob) => {
                blob.body = BlobBody::Spilled { path, gzipped };
                blob.invalidate_digest();
            }
            other => bail!("cannot spill a {} event", other.kind()),
        }
        Ok(())
    }

    /// Pulls every blob body into memory. Required before events migrate to
    /// another repository, whose lifetime is not tied to this one's source
    /// stream handle or scratch directory.
    pub fn internalize_blobs(&mut self) -> Result<()> {
        let mut bodies: Vec<(usize, BString)> = Vec::new();
        for (i, event) in self.events.iter().enumerate() {
            if let Event::Blob(blob) = event
                && !matches!(blob.body, BlobBody::Memory(_))
            {
                bodies.push((i, blob.materialize(self.source_handle.as_ref())?));
            }
        }
        for (i, content) in bodies {
            if let Event::Blob(blob) = &mut self.events[i] {
                blob.body = BlobBody::Memory(content);
            }
        }
        Ok(())
    }

    /// Removes the scratch directory. Called from Drop and from the fatal
    /// error recovery hooks.
    pub fn nuke_scratch(&mut self) {
        if let Some(dir) = self.scratch_dir.take() {
            let _ = std::fs::remove_dir_all(&dir);
        }
    }

    // --- Garbage collection and integrity ---------------------------------

    /// Deletes blobs no live fileop references. Returns the number removed.
    pub fn gc_blobs(&mut self) -> usize {
        let live: HashSet<String> = self
            .events
            .iter()
            .filter_map(Event::as_commit)
            .flat_map(|commit| commit.fileops.iter())
            .filter_map(|op| op.blob_mark().map(str::to_owned))
            .collect();
        let before = self.events.len();
        self.events.retain(|event| match event {
            Event::Blob(blob) => live.contains(&blob.mark),
            _ => true,
        });
        let removed = before - self.events.len();
        if removed > 0 {
            self.declare_sequence_mutation();
        }
        removed
    }

    /// Verifies the canonical invariants; returns one message per violation.
    pub fn check_invariants(&self) -> Vec<String> {
        let mut complaints = Vec::new();
        let mut seen_marks: HashMap<&str, usize> = HashMap::new();
        for (i, event) in self.events.iter().enumerate() {
            if let Some(mark) = event.mark() {
                if let Some(prev) = seen_marks.insert(mark, i) {
                    complaints.push(format!("mark {mark} duplicated at events {prev} and {i}"));
                }
            }
        }
        for (i, event) in self.events.iter().enumerate() {
            match event {
                Event::Commit(commit) => {
                    for parent in &commit.parents {
                        let Some(pmark) = parent.mark() else { continue };
                        match seen_marks.get(pmark) {
                            None => complaints
                                .push(format!("commit at {i} has dangling parent {pmark}")),
                            Some(&pidx) => {
                                if pidx >= i {
                                    complaints.push(format!(
                                        "commit at {i} precedes its parent {pmark} at {pidx}"
                                    ));
                                }
                                if let Some(mark) = &commit.mark
                                    && let Some(pc) = self.commit_at(pidx)
                                    && !pc.children.contains(mark)
                                {
                                    complaints.push(format!(
                                        "parent {pmark} lacks the child link to {mark}"
                                    ));
                                }
                            }
                        }
                    }
                    for op in &commit.fileops {
                        if let Some(bmark) = op.blob_mark() {
                            match seen_marks.get(bmark) {
                                None => complaints.push(format!(
                                    "commit at {i} references missing blob {bmark}"
                                )),
                                Some(&bidx) if bidx >= i => complaints.push(format!(
                                    "blob {bmark} at {bidx} does not precede its commit at {i}"
                                )),
                                _ => {}
                            }
                        }
                    }
                }
                Event::Tag(tag) => {
                    if let Some(mark) = tag.committish.mark()
                        && !seen_marks.contains_key(mark)
                    {
                        complaints.push(format!("tag {} has dangling committish {mark}", tag.name));
                    }
                }
                Event::Reset(reset) => {
                    if let Some(mark) = reset.committish.as_ref().and_then(Committish::mark)
                        && !seen_marks.contains_key(mark)
                    {
                        complaints.push(format!(
                            "reset {} has dangling committish {mark}",
                            reset.ref_name
                        ));
                    }
                }
                _ => {}
            }
        }
        complaints
    }

    /// Event counts by type, for the post-read report.
    pub fn stats(&self) -> HashMap<&'static str, usize> {
        let mut counts = HashMap::new();
        for event in &self.events {
            *counts.entry(event.kind()).or_insert(0) += 1;
        }
        counts
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        self.source_handle = None;
        self.nuke_scratch();
    }
}

/// Applies a commit's fileops to a manifest in order.
pub fn apply_fileops(manifest: &mut Manifest, fileops: &[FileOp]) {
    for op in fileops {
        match op {
            FileOp::Modify {
                mode,
                blobref,
                path,
            } => {
                manifest.insert(
                    path.as_bstr(),
                    ManifestEntry {
                        mode: mode.clone(),
                        blobref: blobref.clone(),
                    },
                );
            }
            FileOp::Delete { path } => {
                manifest.delete_subtree(path.as_bstr());
            }
            FileOp::Rename { source, target } => {
                // A self-rename is the identity, not a delete.
                if source != target {
                    manifest.copy_subtree(source.as_bstr(), target.as_bstr());
                    manifest.delete_subtree(source.as_bstr());
                }
            }
            FileOp::Copy { source, target } => {
                manifest.copy_subtree(source.as_bstr(), target.as_bstr());
            }
            // Notes live in a separate namespace from the tree.
            FileOp::Note { .. } => {}
            FileOp::DeleteAll => {
                *manifest = Manifest::new();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::Attribution;
    use crate::date::Date;
    use crate::event::MODE_NORMAL;

    fn attribution(ts: i64) -> Attribution {
        Attribution::new("A", "a@x", Date::from_epoch(ts, 0).unwrap())
    }

    /// Two commits on master: `:2` adds README from blob `:1`, `:3` deletes
    /// it.
    fn small_repo() -> Repository {
        let mut repo = Repository::new("test");
        let blob = Blob::new(":1", BlobBody::Memory("hello\n".into()));
        repo.events.push(Event::Blob(blob));
        let mut c1 = Commit::new("refs/heads/master", attribution(1600000000));
        c1.mark = Some(":2".to_owned());
        c1.comment = "ci1\n".into();
        c1.fileops.push(FileOp::modify(MODE_NORMAL, ":1", "README"));
        repo.events.push(Event::Commit(c1));
        let mut c2 = Commit::new("refs/heads/master", attribution(1600000100));
        c2.mark = Some(":3".to_owned());
        c2.comment = "ci2\n".into();
        c2.parents.push(Committish::Mark(":2".to_owned()));
        c2.fileops.push(FileOp::delete("README"));
        repo.events.push(Event::Commit(c2));
        repo.note_mark(":3");
        repo.rebuild_children();
        repo
    }

    #[test]
    fn test_mark_index() {
        let repo = small_repo();
        assert_eq!(repo.find_mark(":1"), Some(0));
        assert_eq!(repo.find_mark(":3"), Some(2));
        assert_eq!(repo.find_mark(":9"), None);
    }

    #[test]
    fn test_new_mark_after_note() {
        let mut repo = small_repo();
        assert_eq!(repo.new_mark(), ":4");
    }

    #[test]
    fn test_children_rebuilt() {
        let repo = small_repo();
        let c1 = repo.commit_by_mark(":2").unwrap();
        assert_eq!(c1.children, vec![":3".to_owned()]);
        assert!(repo.commit_by_mark(":3").unwrap().children.is_empty());
    }

    #[test]
    fn test_manifest_walk() {
        let repo = small_repo();
        let m2 = repo.manifest(":2").unwrap();
        assert!(m2.contains(b"README".as_bstr()));
        let m3 = repo.manifest(":3").unwrap();
        assert!(m3.is_empty());
    }

    #[test]
    fn test_visible() {
        let repo = small_repo();
        assert_eq!(repo.visible(1, b"README".as_bstr()), Some(1));
        assert_eq!(repo.visible(2, b"README".as_bstr()), None);
        assert_eq!(repo.visible(2, b"missing".as_bstr()), None);
    }

    #[test]
    fn test_blob_by_name() {
        let repo = small_repo();
        let content = repo.blob_by_name(":2", b"README".as_bstr()).unwrap();
        assert_eq!(content, Some(BString::from("hello\n")));
        let gone = repo.blob_by_name(":3", b"README".as_bstr()).unwrap();
        assert_eq!(gone, None);
    }

    #[test]
    fn test_set_parents_reciprocal() {
        let mut repo = small_repo();
        repo.set_parents(2, vec![]).unwrap();
        assert!(repo.commit_by_mark(":2").unwrap().children.is_empty());
        repo.set_parents(2, vec![Committish::Mark(":2".to_owned())])
            .unwrap();
        assert_eq!(repo.commit_by_mark(":2").unwrap().children, vec![":3".to_owned()]);
        assert!(repo.check_invariants().is_empty());
    }

    #[test]
    fn test_gc_blobs() {
        let mut repo = small_repo();
        // Drop the only commit referencing blob :1.
        repo.commit_mut_at(1).unwrap().fileops.clear();
        assert_eq!(repo.gc_blobs(), 1);
        assert_eq!(repo.events.len(), 2);
    }

    #[test]
    fn test_invariant_detection() {
        let mut repo = small_repo();
        repo.commit_mut_at(2).unwrap().parents = vec![Committish::Mark(":99".to_owned())];
        let complaints = repo.check_invariants();
        assert!(complaints.iter().any(|c| c.contains("dangling parent")));
    }

    #[test]
    fn test_attachments() {
        let mut repo = small_repo();
        repo.events.push(Event::Tag(crate::event::Tag::new(
            "v1",
            Committish::Mark(":3".to_owned()),
        )));
        assert_eq!(repo.attachments(":3"), vec![3]);
        assert!(repo.attachments(":2").is_empty());
    }

    #[test]
    fn test_manifest_invalidation_on_set_parents() {
        let mut repo = small_repo();
        let _ = repo.manifest(":3").unwrap();
        repo.set_parents(2, vec![]).unwrap();
        // With no parent the delete applies to an empty tree.
        let m3 = repo.manifest(":3").unwrap();
        assert!(m3.is_empty());
        let m2 = repo.manifest(":2").unwrap();
        assert_eq!(m2.len(), 1);
    }

    #[test]
    fn test_spill_path_fanout() {
        let path = Repository::spill_path(Path::new("/scratch"), ":1234567");
        assert_eq!(path, PathBuf::from("/scratch/blobs/001/234/567"));
    }

    #[test]
    fn test_branch_queries() {
        let repo = small_repo();
        assert!(repo.branches().contains("refs/heads/master"));
        assert_eq!(repo.branch_tip("refs/heads/master"), Some(2));
        assert_eq!(repo.heads(), vec![2]);
    }
}
