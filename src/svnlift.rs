use crate::attribution::Attribution;
use crate::baton::Baton;
use crate::config::BranchMap;
use crate::config::BranchifyPatterns;
use crate::config::ReadOptions;
use crate::date::Date;
use crate::event::Blob;
use crate::event::BlobBody;
use crate::event::Commit;
use crate::event::Committish;
use crate::event::Event;
use crate::event::FileOp;
use crate::event::MODE_EXECUTABLE;
use crate::event::MODE_NORMAL;
use crate::event::MODE_SYMLINK;
use crate::event::Reset;
use crate::orderedset::Interner;
use crate::pathmap::PathMap;
use crate::repository::Repository;
use crate::svndump::ActionKind;
use crate::svndump::NodeKind;
use crate::svndump::NodeRef;
use crate::svndump::SvnDump;
use crate::svndump::parse_dump;
use anyhow::Context as _;
use anyhow::Result;
use bstr::BStr;
use bstr::BString;
use bstr::ByteSlice as _;
use itertools::Itertools as _;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::collections::HashSet;
use std::io::BufRead;

/// Above this revision count, per-file node records are dropped after
/// commit synthesis to halve the working set, at the cost of degraded
/// diagnostics.
const LARGE_REPO_REVISIONS: usize = 50_000;

lazy_static! {
    static ref CVS2SVN_JUNK: regex::bytes::Regex = regex::bytes::Regex::new(
        r"This commit was manufactured by cvs2svn to create (branch|tag)"
    )
    .unwrap();
}

/// Reads a Subversion dump stream and lifts it to a commit DAG with the
/// default branchify patterns and branch renames.
pub fn read_svn_dump(reader: impl BufRead, name: &str, options: &ReadOptions) -> Result<Repository> {
    let dump = parse_dump(reader)?;
    lift(
        dump,
        name,
        options,
        &BranchifyPatterns::default(),
        &BranchMap::default(),
    )
}

/// One commit synthesized from a revision clique, tracked through the later
/// passes by mark.
#[derive(Debug, Clone)]
struct SynthCommit {
    mark: String,
    revision: u64,
    /// Branch in Subversion path space; empty string is the artificial root
    /// branch.
    branch: String,
    /// Created or resurrected by a directory copy (pass 6 stitches the
    /// parent link).
    from_copy: bool,
}

#[derive(Debug, Clone)]
struct BranchLink {
    revision: u64,
    target: String,
    source: String,
    source_rev: u64,
}

struct Lifter<'a> {
    dump: SvnDump,
    options: &'a ReadOptions,
    patterns: &'a BranchifyPatterns,
    branch_map: &'a BranchMap,
    repo: Repository,
    baton: Baton,
    /// End-of-revision filemap snapshots.
    snapshots: HashMap<u64, PathMap<NodeRef>>,
    /// Blob mark holding the content a node left at its path.
    node_blob: HashMap<NodeRef, String>,
    node_mode: HashMap<NodeRef, std::rc::Rc<str>>,
    /// Mode strings recur once per file touch; interning caps the cost.
    modes: Interner,
    /// Branch-copy links found during commit synthesis.
    branch_links: Vec<BranchLink>,
    /// File-copy flows that may collectively form an implicit branch link:
    /// `(revision, target branch, source branch) -> (count, max source rev)`.
    implicit_links: HashMap<(u64, String, String), (usize, u64)>,
    /// Raw `svn:mergeinfo` values per revision and branch, processed in
    /// pass 7.
    mergeinfo_values: Vec<(u64, String, BString)>,
    /// Recorded mergeinfo per branch: source branch to highest merged rev.
    mergeinfo: HashMap<String, HashMap<String, u64>>,
    /// Commit history per branch as `(revision, mark)`, ascending.
    branch_commits: HashMap<String, Vec<(u64, String)>>,
    commits: Vec<SynthCommit>,
    /// Paths of .gitignore files generated from svn:ignore.
    generated_ignores: HashSet<BString>,
    warnings: Vec<String>,
}

/// Lifts a parsed dump into a Repository, running the analysis passes in
/// order.
#[tracing::instrument(skip_all, fields(revisions = dump.revisions.len()))]
pub fn lift(
    dump: SvnDump,
    name: &str,
    options: &ReadOptions,
    patterns: &BranchifyPatterns,
    branch_map: &BranchMap,
) -> Result<Repository> {
    let mut repo = Repository::new(name);
    repo.sourcetype = Some("svn".to_owned());
    let mut lifter = Lifter {
        dump,
        options,
        patterns,
        branch_map,
        repo,
        baton: Baton::new(true),
        snapshots: HashMap::new(),
        node_blob: HashMap::new(),
        node_mode: HashMap::new(),
        modes: Interner::new(),
        branch_links: Vec::new(),
        implicit_links: HashMap::new(),
        mergeinfo_values: Vec::new(),
        mergeinfo: HashMap::new(),
        branch_commits: HashMap::new(),
        commits: Vec::new(),
        generated_ignores: HashSet::new(),
        warnings: Vec::new(),
    };
    if !lifter.options.preserve {
        lifter.pass0_dead_branches();
    }
    lifter.pass2_filemaps();
    lifter.pass3_copy_sources();
    lifter.pass4_synthesize()?;
    lifter.pass5_branches()?;
    lifter.pass6_copy_links()?;
    lifter.pass7_mergeinfo()?;
    lifter.pass8_tagify()?;
    lifter.pass9_rename_branches();
    lifter.pass10_polish()?;
    for warning in &lifter.warnings {
        log::warn!("{warning}");
    }
    lifter.baton.finish();
    Ok(lifter.repo)
}

fn under(path: &str, prefix: &str) -> bool {
    path == prefix || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl Lifter<'_> {
    /// Pass 0: drop branches and tags whose entire history ends in a tip
    /// delete and that nothing ever copies from. Trunk is exempt; a trunk
    /// tip delete is operator error surfaced as a warning.
    fn pass0_dead_branches(&mut self) {
        self.baton.phase("analyzing for dead branches");
        let copy_sources: Vec<(String, u64)> = self
            .dump
            .revisions
            .iter()
            .flat_map(|record| record.nodes.iter())
            .filter_map(|node| {
                node.from_path
                    .clone()
                    .map(|path| (path, node.from_rev.unwrap_or(0)))
            })
            .collect();
        for ri in (0..self.dump.revisions.len()).rev() {
            for ni in (0..self.dump.revisions[ri].nodes.len()).rev() {
                let node = &self.dump.revisions[ri].nodes[ni];
                if node.dead || node.action != ActionKind::Delete || node.kind == NodeKind::File {
                    continue;
                }
                if under(&node.path, "trunk") {
                    self.warnings.push(format!(
                        "r{}: tip delete of {} on trunk looks like operator error",
                        node.revision, node.path
                    ));
                    continue;
                }
                if !under(&node.path, "tags") && !under(&node.path, "branches") {
                    continue;
                }
                let path = node.path.clone();
                let delete_rev = node.revision;
                let needed = copy_sources
                    .iter()
                    .any(|(src, src_rev)| under(src, &path) && *src_rev < delete_rev);
                if needed {
                    continue;
                }
                log::debug!("r{delete_rev}: dead branch {path} eliminated");
                for rj in 0..=ri {
                    let limit = if rj == ri {
                        ni + 1
                    } else {
                        self.dump.revisions[rj].nodes.len()
                    };
                    for node2 in &mut self.dump.revisions[rj].nodes[..limit] {
                        if under(&node2.path, &path) {
                            node2.dead = true;
                        }
                    }
                }
            }
        }
    }

    /// Pass 2 (pass 1 data falls out of the same walk): build the
    /// per-revision filemap snapshots and stamp the derived node fields that
    /// later passes depend on.
    fn pass2_filemaps(&mut self) {
        self.baton.phase("building filemaps");
        let mut filemap: PathMap<NodeRef> = PathMap::new();
        for record in &mut self.dump.revisions {
            self.baton.tick();
            for ni in 0..record.nodes.len() {
                let (path, kind, action, from, dead) = {
                    let node = &record.nodes[ni];
                    (
                        BString::from(node.path.as_str()),
                        node.kind,
                        node.action,
                        node.from_rev.zip(node.from_path.clone()),
                        node.dead,
                    )
                };
                if dead {
                    continue;
                }
                let noderef: NodeRef = (record.revision, ni);
                match action {
                    ActionKind::Delete => {
                        let node = &mut record.nodes[ni];
                        node.deleted_paths = filemap
                            .entries_under(path.as_bstr())
                            .into_iter()
                            .map(|(p, _)| p)
                            .collect();
                        filemap.delete_subtree(path.as_bstr());
                        continue;
                    }
                    ActionKind::Replace if kind == NodeKind::Dir => {
                        let node = &mut record.nodes[ni];
                        node.deleted_paths = filemap
                            .entries_under(path.as_bstr())
                            .into_iter()
                            .map(|(p, _)| p)
                            .collect();
                        filemap.delete_subtree(path.as_bstr());
                    }
                    _ => {}
                }
                if let Some((from_rev, from_path)) = &from {
                    record.nodes[ni].target_preexisting =
                        filemap.count_under(path.as_bstr()) > 0;
                    match self.snapshots.get(from_rev) {
                        Some(source) => {
                            filemap.overlay_from(
                                source,
                                from_path.as_bytes().as_bstr(),
                                path.as_bstr(),
                            );
                        }
                        None => {
                            self.warnings.push(format!(
                                "r{}: copy of {} from nonexistent r{}",
                                record.revision, from_path, from_rev
                            ));
                        }
                    }
                }
                if kind == NodeKind::File {
                    record.nodes[ni].prior = filemap.get(path.as_bstr()).copied();
                    filemap.insert(path.as_bstr(), noderef);
                }
            }
            self.snapshots.insert(record.revision, filemap.clone());
        }
    }

    /// Pass 3: materialize the copied path sets of directory copies from
    /// the source-revision snapshots.
    fn pass3_copy_sources(&mut self) {
        self.baton.phase("materializing copy sources");
        for record in &mut self.dump.revisions {
            for node in &mut record.nodes {
                if node.dead || node.kind != NodeKind::Dir || !node.is_copy() {
                    continue;
                }
                let from_rev = node.from_rev.unwrap();
                let from_path = node.from_path.clone().unwrap();
                if let Some(snapshot) = self.snapshots.get(&from_rev) {
                    node.copied_entries =
                        snapshot.entries_under(from_path.as_bytes().as_bstr());
                }
            }
        }
    }

    fn synthesized_attribution(&self, record_author: Option<&BStr>, date: Date) -> Attribution {
        let author = record_author
            .and_then(|a| a.to_str().ok())
            .unwrap_or("no-author")
            .to_owned();
        let email = if author.contains('@') {
            author.clone()
        } else if self.options.use_uuid
            && let Some(uuid) = &self.dump.uuid
        {
            format!("{author}@{uuid}")
        } else {
            author.clone()
        };
        Attribution::new(author, email, date)
    }

    fn branch_key(&self, path: &str) -> String {
        if self.options.nobranch {
            return String::new();
        }
        self.patterns.branch_of(path).unwrap_or("").to_owned()
    }

    /// True when `path` itself is a recognized branch root.
    fn is_branch_root(&self, path: &str) -> bool {
        !self.options.nobranch && self.patterns.branch_of(path) == Some(path)
    }

    fn new_blob(&mut self, content: BString) -> String {
        let mark = self.repo.new_mark();
        self.repo
            .events
            .push(Event::Blob(Blob::new(mark.clone(), BlobBody::Memory(content))));
        mark
    }

    /// Pass 4: expand each revision's node actions into fileops, then
    /// partition them into branch cliques and mint one commit per clique.
    fn pass4_synthesize(&mut self) -> Result<()> {
        self.baton.phase("synthesizing commits");
        let records = std::mem::take(&mut self.dump.revisions);
        for record in &records {
            self.baton.tick();
            let live_nodes: Vec<usize> = (0..record.nodes.len())
                .filter(|&ni| !record.nodes[ni].dead)
                .collect();
            if live_nodes.is_empty() {
                continue;
            }
            // (branch clique key, op)
            let mut ops: Vec<(String, FileOp)> = Vec::new();
            // Branch hint for revisions whose nodes yield no fileops.
            let mut branch_hint: Option<String> = None;

            for &ni in &live_nodes {
                let node = &record.nodes[ni];
                let noderef: NodeRef = (record.revision, ni);
                if branch_hint.is_none() {
                    let key = self.branch_key(&node.path);
                    if !key.is_empty() {
                        branch_hint = Some(key);
                    }
                }
                match (node.kind, node.action) {
                    (NodeKind::File, ActionKind::Add | ActionKind::Change | ActionKind::Replace) => {
                        let prior_mode = node
                            .prior
                            .and_then(|p| self.node_mode.get(&p))
                            .cloned();
                        let mode = match &node.props {
                            Some(props) => {
                                if props.contains_key("svn:special") {
                                    MODE_SYMLINK
                                } else if props.contains_key("svn:executable") {
                                    MODE_EXECUTABLE
                                } else {
                                    MODE_NORMAL
                                }
                            }
                            None => prior_mode.as_deref().unwrap_or(MODE_NORMAL),
                        }
                        .to_owned();
                        let blob_mark = if let Some(content) = &node.blob {
                            let cooked = if mode == MODE_SYMLINK {
                                content
                                    .strip_prefix(b"link ")
                                    .map(BString::from)
                                    .unwrap_or_else(|| content.clone())
                            } else {
                                content.clone()
                            };
                            Some(self.new_blob(cooked))
                        } else {
                            node.prior.and_then(|p| self.node_blob.get(&p)).cloned()
                        };
                        let blob_mark = match blob_mark {
                            Some(mark) => mark,
                            // A file add with no text and no ancestor is an
                            // empty file.
                            None if node.action == ActionKind::Add => {
                                self.new_blob(BString::from(""))
                            }
                            None => {
                                self.warnings.push(format!(
                                    "r{}: change of {} has no content to inherit",
                                    record.revision, node.path
                                ));
                                continue;
                            }
                        };
                        self.node_blob.insert(noderef, blob_mark.clone());
                        let interned = self.modes.intern(&mode);
                        self.node_mode.insert(noderef, interned);
                        let changed_content = node.blob.is_some() || node.is_copy();
                        let changed_mode =
                            prior_mode.is_some() && prior_mode.as_deref() != Some(mode.as_str());
                        if changed_content || changed_mode || node.prior.is_none() {
                            ops.push((
                                self.branch_key(&node.path),
                                FileOp::modify(&mode, blob_mark, node.path.as_str()),
                            ));
                        } else if node.has_properties() && !self.options.ignore_properties {
                            self.warnings.push(format!(
                                "r{}: properties set on {} with no material effect",
                                record.revision, node.path
                            ));
                        }
                        if let Some((from_rev, from_path)) = node.from_rev.zip(node.from_path.as_deref())
                        {
                            let source_branch = self.branch_key(from_path);
                            let target_branch = self.branch_key(&node.path);
                            if !source_branch.is_empty() && source_branch != target_branch {
                                let entry = self
                                    .implicit_links
                                    .entry((record.revision, target_branch, source_branch))
                                    .or_insert((0, 0));
                                entry.0 += 1;
                                entry.1 = entry.1.max(from_rev);
                            }
                        }
                    }
                    (_, ActionKind::Delete) | (NodeKind::Dir, ActionKind::Replace) => {
                        if node.action == ActionKind::Delete
                            && self.is_branch_root(&node.path)
                            && node.kind != NodeKind::File
                        {
                            // A branch-root delete compresses to a tree
                            // clear; pass 8 may turn it into a tipdelete tag.
                            ops.push((node.path.clone(), FileOp::DeleteAll));
                        } else {
                            for path in &node.deleted_paths {
                                let key = self.branch_key(&path.to_str_lossy());
                                ops.push((key, FileOp::Delete { path: path.clone() }));
                            }
                            if node.kind != NodeKind::Dir && node.deleted_paths.is_empty() {
                                // Plain file delete.
                                let key = self.branch_key(&node.path);
                                ops.push((
                                    key,
                                    FileOp::Delete {
                                        path: node.path.as_str().into(),
                                    },
                                ));
                            }
                        }
                        // Generated ignore files under the subtree go too.
                        let doomed: Vec<BString> = self
                            .generated_ignores
                            .iter()
                            .filter(|p| {
                                under(&p.to_str_lossy(), &node.path)
                            })
                            .cloned()
                            .collect();
                        for path in doomed {
                            self.generated_ignores.remove(&path);
                            let key = self.branch_key(&path.to_str_lossy());
                            ops.push((key, FileOp::Delete { path }));
                        }
                        if node.kind == NodeKind::Dir
                            && node.action == ActionKind::Replace
                            && node.is_copy()
                        {
                            self.expand_dir_copy(record.revision, ni, node, &mut ops);
                        }
                    }
                    (NodeKind::Dir, ActionKind::Add) if node.is_copy() => {
                        self.expand_dir_copy(record.revision, ni, node, &mut ops);
                    }
                    (NodeKind::Dir, ActionKind::Add | ActionKind::Change) => {
                        // A bare directory add contributes no fileops; the
                        // branch fills in through subsequent file adds.
                    }
                    (NodeKind::Unknown, _) => {
                        self.warnings.push(format!(
                            "r{}: node {} has indeterminate kind",
                            record.revision, node.path
                        ));
                    }
                    _ => {}
                }
                // Directory properties: ignore generation and mergeinfo.
                if node.kind == NodeKind::Dir
                    && let Some(props) = &node.props
                {
                    if let Some(value) = props.get("svn:mergeinfo") {
                        let branch = self.branch_key(&node.path);
                        self.mergeinfo_values.push((
                            record.revision,
                            branch,
                            value.clone(),
                        ));
                    }
                    if !self.options.user_ignores {
                        let ignore_path: BString = if node.path.is_empty() {
                            ".gitignore".into()
                        } else {
                            format!("{}/.gitignore", node.path).into()
                        };
                        if let Some(value) = props.get("svn:ignore") {
                            let content = gitignore_content(value.as_bstr());
                            let mark = self.new_blob(content);
                            let key = self.branch_key(&node.path);
                            ops.push((
                                key,
                                FileOp::modify(MODE_NORMAL, mark, ignore_path.clone()),
                            ));
                            self.generated_ignores.insert(ignore_path);
                        } else if self.generated_ignores.remove(&ignore_path) {
                            let key = self.branch_key(&node.path);
                            ops.push((key, FileOp::Delete { path: ignore_path }));
                        }
                    }
                }
            }

            self.mint_commits(record, ops, branch_hint)?;
        }
        self.dump.revisions = records;
        if self.dump.revisions.len() > LARGE_REPO_REVISIONS {
            for record in &mut self.dump.revisions {
                record.nodes.retain(|node| node.kind == NodeKind::Dir);
            }
        } else {
            // Blob payloads have moved into events; no need to keep a second
            // copy on the nodes.
            for record in &mut self.dump.revisions {
                for node in &mut record.nodes {
                    node.blob = None;
                }
            }
        }
        Ok(())
    }

    /// Expands a directory copy into either a branch link (stitched in pass
    /// 6) or synthetic file adds from the source snapshot.
    fn expand_dir_copy(
        &mut self,
        revision: u64,
        _ni: usize,
        node: &crate::svndump::NodeAction,
        ops: &mut Vec<(String, FileOp)>,
    ) {
        let from_path = node.from_path.clone().unwrap();
        let from_rev = node.from_rev.unwrap();
        let source_is_branch = self.is_branch_root(&from_path);
        let target_is_branch = self.is_branch_root(&node.path);
        if source_is_branch
            && target_is_branch
            && from_path != node.path
            && !node.target_preexisting
        {
            // Branch creation: the target inherits the source tree through a
            // parent link instead of file copies.
            self.branch_links.push(BranchLink {
                revision,
                target: node.path.clone(),
                source: from_path,
                source_rev: from_rev,
            });
            return;
        }
        // Resurrection or a copy from an unrecognized source: emit the
        // source snapshot as synthetic adds.
        for (src_path, sref) in &node.copied_entries {
            let rel = src_path
                .strip_prefix(from_path.as_bytes())
                .map(|r| r.strip_prefix(b"/").unwrap_or(r))
                .unwrap_or(src_path);
            let mut target: BString = node.path.as_str().into();
            if !rel.is_empty() {
                if !target.is_empty() {
                    target.push(b'/');
                }
                target.extend_from_slice(rel);
            }
            let Some(mark) = self.node_blob.get(sref).cloned() else {
                self.warnings.push(format!(
                    "r{revision}: copy source {src_path:?} has no recorded content"
                ));
                continue;
            };
            let mode = self
                .node_mode
                .get(sref)
                .map(|m| m.to_string())
                .unwrap_or_else(|| MODE_NORMAL.to_owned());
            let key = self.branch_key(&target.to_str_lossy());
            ops.push((key, FileOp::modify(&mode, mark, target)));
        }
        if node.target_preexisting && source_is_branch && target_is_branch {
            // Resurrected branches also regain their ancestry.
            self.branch_links.push(BranchLink {
                revision,
                target: node.path.clone(),
                source: node.from_path.clone().unwrap(),
                source_rev: from_rev,
            });
        }
    }

    /// Creates the commit (and split commits) for one revision from its
    /// branch cliques.
    fn mint_commits(
        &mut self,
        record: &crate::svndump::RevisionRecord,
        ops: Vec<(String, FileOp)>,
        branch_hint: Option<String>,
    ) -> Result<()> {
        let date = match record.date() {
            Some(value) => match Date::parse_svn(&value.to_str_lossy()) {
                Ok(date) => date,
                Err(_) => {
                    self.warnings.push(format!(
                        "r{}: undecipherable svn:date {:?}",
                        record.revision, value
                    ));
                    Date::from_epoch(0, 0).unwrap()
                }
            },
            None => {
                self.warnings
                    .push(format!("r{}: missing svn:date", record.revision));
                Date::from_epoch(0, 0).unwrap()
            }
        };
        let committer = self.synthesized_attribution(record.author().map(|a| a.as_bstr()), date);
        let mut comment: BString = record.log().cloned().unwrap_or_default();
        if !comment.is_empty() && !comment.ends_with(b"\n") {
            comment.push(b'\n');
        }

        // Cliques in order of first appearance.
        let mut cliques: Vec<(String, Vec<FileOp>)> = Vec::new();
        for (key, op) in ops {
            match cliques.iter_mut().find(|(k, _)| *k == key) {
                Some((_, clique)) => clique.push(op),
                None => cliques.push((key, vec![op])),
            }
        }
        // The first non-deleteall clique keeps the original identity.
        if let Some(pos) = cliques
            .iter()
            .position(|(_, ops)| !ops.iter().all(FileOp::is_deleteall))
            && pos != 0
        {
            let first = cliques.remove(pos);
            cliques.insert(0, first);
        }
        if cliques.is_empty() {
            cliques.push((branch_hint.unwrap_or_default(), Vec::new()));
        }

        let revision = record.revision;
        let extra_props: Vec<(String, BString)> = record
            .props
            .iter()
            .filter(|(k, _)| !matches!(*k, "svn:log" | "svn:author" | "svn:date"))
            .map(|(k, v)| (k.to_owned(), v.clone()))
            .collect();
        if !extra_props.is_empty() && !self.options.ignore_properties {
            self.warnings.push(format!(
                "r{revision}: revision carries nonstandard properties {}",
                extra_props.iter().map(|(k, _)| k).join(", ")
            ));
        }

        let total = cliques.len();
        for (ordinal, (branch, mut fileops)) in cliques.into_iter().enumerate() {
            // Inside a recognized branch, paths are relative to the branch
            // root the way a git checkout would see them.
            if !branch.is_empty() {
                for op in &mut fileops {
                    strip_branch_prefix(&branch, op);
                }
            }
            let mark = self.repo.new_mark();
            let legacy = if ordinal == 0 {
                revision.to_string()
            } else {
                format!("{revision}.{ordinal}")
            };
            let mut commit = Commit::new(branch.clone(), committer.clone());
            commit.mark = Some(mark.clone());
            commit.comment = comment.clone();
            commit.fileops = fileops;
            commit.legacy_id = Some(legacy.clone());
            if total > 1 {
                log::debug!("r{revision}: split commit {legacy} on {branch:?}");
            }
            for (key, value) in &extra_props {
                commit.properties.insert(key.clone(), value.clone());
            }
            self.repo.legacy_map.insert(legacy, mark.clone());
            self.repo.events.push(Event::Commit(commit));
            let from_copy = self
                .branch_links
                .iter()
                .any(|link| link.revision == revision && link.target == branch);
            self.commits.push(SynthCommit {
                mark,
                revision,
                branch,
                from_copy,
            });
        }
        Ok(())
    }

    /// Pass 5: assign parents by branch - each commit descends from the
    /// previous commit on its branch.
    fn pass5_branches(&mut self) -> Result<()> {
        self.baton.phase("resolving branches");
        for synth in &self.commits {
            let history = self.branch_commits.entry(synth.branch.clone()).or_default();
            let parent = history.last().map(|(_, mark)| mark.clone());
            history.push((synth.revision, synth.mark.clone()));
            if let Some(parent) = parent {
                let index = self
                    .repo
                    .find_mark(&synth.mark)
                    .context("synthesized commit vanished")?;
                self.repo
                    .set_parents(index, vec![Committish::Mark(parent)])?;
            }
        }
        self.repo.rebuild_children();
        Ok(())
    }

    /// The most recent commit on `branch` at or before `revision`.
    fn commit_on_branch_at(&self, branch: &str, revision: u64) -> Option<String> {
        let history = self.branch_commits.get(branch)?;
        history
            .iter()
            .rev()
            .find(|(rev, _)| *rev <= revision)
            .map(|(_, mark)| mark.clone())
    }

    fn add_parent(&mut self, commit_mark: &str, parent_mark: &str) -> Result<()> {
        let index = self
            .repo
            .find_mark(commit_mark)
            .with_context(|| format!("no commit {commit_mark}"))?;
        let commit = self.repo.commit_at(index).unwrap();
        if commit.has_parent_mark(parent_mark) {
            return Ok(());
        }
        let mut parents = commit.parents.clone();
        parents.push(Committish::Mark(parent_mark.to_owned()));
        self.repo.set_parents(index, parents)
    }

    /// Pass 6: stitch copy-driven parent links for branch creations and
    /// resurrections, and implicit links formed by bulk file copies.
    fn pass6_copy_links(&mut self) -> Result<()> {
        self.baton.phase("stitching copy parents");
        for link in self.branch_links.clone() {
            let Some(target_mark) = self
                .commits
                .iter()
                .find(|s| s.revision == link.revision && s.branch == link.target)
                .map(|s| s.mark.clone())
            else {
                continue;
            };
            let Some(parent_mark) = self.commit_on_branch_at(&link.source, link.source_rev) else {
                self.warnings.push(format!(
                    "r{}: no commit found on {} at or before r{}",
                    link.revision, link.source, link.source_rev
                ));
                continue;
            };
            // The copy parent is the branch's ancestry; it goes first.
            let index = self.repo.find_mark(&target_mark).unwrap();
            let commit = self.repo.commit_at(index).unwrap();
            if !commit.has_parent_mark(&parent_mark) {
                let mut parents = commit.parents.clone();
                parents.insert(0, Committish::Mark(parent_mark.clone()));
                self.repo.set_parents(index, parents)?;
            }
            // The new branch inherits the source's merge bookkeeping.
            if let Some(source_info) = self.mergeinfo.get(&link.source).cloned() {
                self.mergeinfo
                    .entry(link.target.clone())
                    .or_default()
                    .extend(source_info);
            }
        }
        for ((revision, target, source), (count, max_rev)) in self.implicit_links.clone() {
            if count < 2 {
                continue;
            }
            let explicit = self
                .branch_links
                .iter()
                .any(|l| l.revision == revision && l.target == target);
            if explicit {
                continue;
            }
            self.warnings.push(format!(
                "r{revision}: {count} file copies from {source} into {target} treated as an implicit branch link"
            ));
            let Some(target_mark) = self
                .commits
                .iter()
                .find(|s| s.revision == revision && s.branch == target)
                .map(|s| s.mark.clone())
            else {
                continue;
            };
            if let Some(parent_mark) = self.commit_on_branch_at(&source, max_rev) {
                self.add_parent(&target_mark, &parent_mark)?;
            }
        }
        Ok(())
    }

    /// Pass 7: turn svn:mergeinfo deltas into merge parent links.
    fn pass7_mergeinfo(&mut self) -> Result<()> {
        self.baton.phase("resolving mergeinfo");
        for (revision, branch, value) in self.mergeinfo_values.clone() {
            let recorded = self.mergeinfo.entry(branch.clone()).or_default().clone();
            let mut new_links: Vec<(String, u64)> = Vec::new();
            for line in bstr::ByteSlice::lines(value.as_slice()) {
                let Ok(line) = line.to_str() else { continue };
                let line = line.trim().trim_end_matches('*');
                let Some((path, ranges)) = line.rsplit_once(':') else {
                    continue;
                };
                let source = path.trim_matches('/').to_owned();
                let mut span_end: Option<u64> = None;
                for range in ranges.split(',') {
                    let range = range.trim().trim_end_matches('*');
                    if let Some((a, b)) = range.split_once('-') {
                        if let (Ok(a), Ok(b)) = (a.parse::<u64>(), b.parse::<u64>())
                            && b > a
                        {
                            span_end = Some(span_end.unwrap_or(0).max(b));
                        }
                    }
                    // Single-revision spans are cherry-picks we cannot
                    // faithfully represent.
                }
                if let Some(end) = span_end
                    && recorded.get(&source).copied().unwrap_or(0) < end
                {
                    new_links.push((source, end));
                }
            }
            let Some(commit_mark) = self
                .commits
                .iter()
                .find(|s| s.revision == revision && s.branch == branch)
                .map(|s| s.mark.clone())
            else {
                continue;
            };
            for (source, end) in new_links {
                if source == branch {
                    continue;
                }
                if let Some(parent_mark) = self.commit_on_branch_at(&source, end) {
                    self.add_parent(&commit_mark, &parent_mark)?;
                }
                self.mergeinfo
                    .entry(branch.clone())
                    .or_default()
                    .insert(source, end);
            }
        }
        Ok(())
    }

    /// Pass 8: turn empty and tipdelete commits into annotated tags and drop
    /// cvs2svn manufactured-branch junk.
    fn pass8_tagify(&mut self) -> Result<()> {
        self.baton.phase("tagifying empty commits");
        use crate::config::SquashPolicy;
        use crate::surgery;

        // cvs2svn marker commits are dropped outright.
        let junk: Vec<String> = self
            .repo
            .events
            .iter()
            .filter_map(Event::as_commit)
            .filter(|c| c.is_empty() && CVS2SVN_JUNK.is_match(&c.comment))
            .filter_map(|c| c.mark.clone())
            .collect();
        if !junk.is_empty() {
            let selection: crate::orderedset::OrderedIntSet = junk
                .iter()
                .filter_map(|m| self.repo.find_mark(m))
                .collect();
            let policy = SquashPolicy {
                delete: true,
                quiet: true,
                ..Default::default()
            };
            surgery::squash(&mut self.repo, &selection, &policy)?;
        }

        let first_commit_mark = self
            .repo
            .events
            .iter()
            .filter_map(Event::as_commit)
            .find_map(|c| c.mark.clone());
        let mut planned: Vec<(String, String)> = Vec::new();
        for synth_mark in self.commits.iter().map(|s| s.mark.clone()) {
            let Some(commit) = self.repo.commit_by_mark(&synth_mark) else {
                continue;
            };
            let branch = commit.branch.clone();
            let name = if commit.is_tipdelete() && commit.children.is_empty() {
                format!("tipdelete-{}", basename(&branch))
            } else if !commit.is_empty() {
                continue;
            } else if Some(&synth_mark) == first_commit_mark.as_ref() {
                "root".to_owned()
            } else if under(&branch, "tags") && commit.parents.len() == 1 && {
                let synth = self.commits.iter().find(|s| s.mark == synth_mark);
                synth.is_some_and(|s| s.from_copy)
            } {
                basename(&branch).to_owned()
            } else {
                format!(
                    "emptycommit-{}",
                    commit.legacy_id.clone().unwrap_or_else(|| synth_mark
                        .trim_start_matches(':')
                        .to_owned())
                )
            };
            planned.push((synth_mark, name));
        }
        for (mark, name) in planned {
            let Some(index) = self.repo.find_mark(&mark) else {
                continue;
            };
            if surgery::tagify_commit(&mut self.repo, index, Some(name), true)?.is_some() {
                let selection: crate::orderedset::OrderedIntSet =
                    [index].into_iter().collect();
                let policy = SquashPolicy {
                    delete: true,
                    tagback: true,
                    quiet: true,
                    ..Default::default()
                };
                surgery::squash(&mut self.repo, &selection, &policy)?;
            }
        }
        Ok(())
    }

    /// Pass 9: map Subversion branch paths to git refs and plant resets at
    /// the branch tips.
    fn pass9_rename_branches(&mut self) {
        self.baton.phase("renaming branches");
        let nobranch = self.options.nobranch;
        let branch_map = self.branch_map;
        let rename = move |branch: &str| -> String {
            if branch.starts_with("refs/") {
                return branch.to_owned();
            }
            if nobranch {
                return "refs/heads/master".to_owned();
            }
            if !branch_map.is_empty() {
                let mapped = branch_map.rename(branch);
                if mapped != branch {
                    return mapped;
                }
            }
            if branch == "trunk" {
                "refs/heads/master".to_owned()
            } else if let Some(tag) = branch.strip_prefix("tags/") {
                format!("refs/tags/{tag}")
            } else if let Some(name) = branch.strip_prefix("branches/") {
                format!("refs/heads/{name}")
            } else if branch.is_empty() || branch == "root" {
                "refs/heads/root".to_owned()
            } else {
                format!("refs/heads/{}", basename(branch))
            }
        };
        for event in &mut self.repo.events {
            if let Event::Commit(commit) = event {
                commit.branch = rename(&commit.branch);
            }
        }
        // Plant a reset at each branch tip so importers create the refs.
        let branches = self.repo.branches();
        let mut resets = Vec::new();
        for branch in branches.iter() {
            if let Some(tip) = self.repo.branch_tip(branch)
                && let Some(mark) = self.repo.events[tip].mark()
            {
                resets.push(Reset::new(
                    branch.to_owned(),
                    Some(Committish::Mark(mark.to_owned())),
                ));
            }
        }
        for reset in resets {
            self.repo.events.push(Event::Reset(reset));
        }
        self.repo.declare_sequence_mutation();
    }

    /// Pass 10: debubble trivial merges, strip cvs2svn D/M stutter, and
    /// renumber marks densely.
    fn pass10_polish(&mut self) -> Result<()> {
        self.baton.phase("polishing");
        // Remove two-parent merges where one parent is a same-branch
        // ancestor of the other.
        let mut debubbles: Vec<(usize, usize)> = Vec::new();
        for (index, event) in self.repo.events.iter().enumerate() {
            let Some(commit) = event.as_commit() else {
                continue;
            };
            if commit.parents.len() != 2 {
                continue;
            }
            let marks = commit.parent_marks();
            if marks.len() != 2 {
                continue;
            }
            for (a, b) in [(0, 1), (1, 0)] {
                if self.first_parent_ancestor(marks[b], marks[a])
                    && self
                        .repo
                        .commit_by_mark(marks[a])
                        .zip(self.repo.commit_by_mark(marks[b]))
                        .is_some_and(|(pa, pb)| pa.branch == pb.branch)
                {
                    debubbles.push((index, a));
                    break;
                }
            }
        }
        for (index, parent_pos) in debubbles {
            let commit = self.repo.commit_at(index).unwrap();
            let mut parents = commit.parents.clone();
            parents.remove(parent_pos);
            self.repo.set_parents(index, parents)?;
        }
        // cvs2svn emits adjacent delete/re-add stutter.
        for event in &mut self.repo.events {
            let Some(commit) = event.as_commit_mut() else {
                continue;
            };
            let mut k = 0;
            while k + 1 < commit.fileops.len() {
                let stutter = matches!(
                    (&commit.fileops[k], &commit.fileops[k + 1]),
                    (FileOp::Delete { path: d }, FileOp::Modify { path: m, .. }) if d == m
                );
                if stutter {
                    commit.fileops.remove(k);
                } else {
                    k += 1;
                }
            }
        }
        crate::surgery::renumber(&mut self.repo);
        Ok(())
    }

    /// Whether `ancestor` lies on the first-parent chain of `descendant`.
    fn first_parent_ancestor(&self, descendant: &str, ancestor: &str) -> bool {
        let mut cursor = descendant.to_owned();
        loop {
            if cursor == ancestor {
                return true;
            }
            match self
                .repo
                .commit_by_mark(&cursor)
                .and_then(Commit::first_parent_mark)
            {
                Some(parent) => cursor = parent.to_owned(),
                None => return false,
            }
        }
    }
}

/// Rewrites one fileop's paths relative to its branch root.
fn strip_branch_prefix(branch: &str, op: &mut FileOp) {
    let strip = |path: &mut BString| {
        let mut prefix = branch.as_bytes().to_vec();
        prefix.push(b'/');
        if let Some(rel) = path.strip_prefix(prefix.as_slice()) {
            *path = rel.into();
        }
    };
    match op {
        FileOp::Modify { path, .. } | FileOp::Delete { path } | FileOp::Note { path, .. } => {
            strip(path);
        }
        FileOp::Rename { source, target } | FileOp::Copy { source, target } => {
            strip(source);
            strip(target);
        }
        FileOp::DeleteAll => {}
    }
}

/// Translates an svn:ignore property value to .gitignore content. Leading
/// slashes pin each pattern to the directory, matching Subversion's
/// non-recursive semantics under git's recursive matching.
fn gitignore_content(value: &BStr) -> BString {
    let mut out = BString::from("");
    for line in bstr::ByteSlice::lines(value.as_bytes()) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !line.starts_with(b"/") {
            out.push(b'/');
        }
        out.extend_from_slice(line);
        out.push(b'\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
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

    /// Builds a dump revision with standard props.
    fn revision(number: u64, log: &str, date_minute: u64, nodes: &str) -> String {
        let body = props(&[
            ("svn:log", log),
            ("svn:author", "esr"),
            (
                "svn:date",
                &format!("2020-09-13T12:{:02}:00.000000Z", date_minute),
            ),
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

    fn dir_add(path: &str) -> String {
        format!("Node-path: {path}\nNode-kind: dir\nNode-action: add\n\n")
    }

    fn dir_copy(path: &str, from: &str, rev: u64) -> String {
        format!(
            "Node-path: {path}\nNode-kind: dir\nNode-action: add\nNode-copyfrom-rev: {rev}\nNode-copyfrom-path: {from}\n\n"
        )
    }

    fn lift_text(dump: &str) -> Repository {
        read_svn_dump(dump.as_bytes(), "test", &ReadOptions::default()).unwrap()
    }

    fn commits(repo: &Repository) -> Vec<&Commit> {
        repo.events.iter().filter_map(Event::as_commit).collect()
    }

    fn tags(repo: &Repository) -> Vec<&Tag> {
        repo.events.iter().filter_map(Event::as_tag).collect()
    }

    fn simple_dump() -> String {
        let mut dump = String::from("SVN-fs-dump-format-version: 2\n\n");
        dump.push_str(&revision(
            1,
            "add trunk",
            0,
            &(dir_add("trunk") + &file_add("trunk/README", "hello")),
        ));
        dump.push_str(&revision(
            2,
            "branch off",
            1,
            &dir_copy("branches/dev", "trunk", 1),
        ));
        dump.push_str(&revision(
            3,
            "work on dev",
            2,
            &file_add("branches/dev/NEWS", "news"),
        ));
        dump
    }

    #[test]
    fn test_simple_lift_shape() {
        let repo = lift_text(&simple_dump());
        let commits = commits(&repo);
        // r1 lands on trunk and r3 on dev; the empty branch-creation commit
        // of r2 tagifies away, leaving r3 parented on the copy source.
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].branch, "refs/heads/master");
        assert_eq!(commits[0].legacy_id.as_deref(), Some("1"));
        assert_eq!(commits[1].branch, "refs/heads/dev");
        assert_eq!(commits[1].legacy_id.as_deref(), Some("3"));
        assert_eq!(
            commits[1].parent_marks(),
            vec![commits[0].mark.as_deref().unwrap()]
        );
        let tag_names: Vec<&str> = tags(&repo).iter().map(|t| t.name.as_str()).collect();
        assert_eq!(tag_names, vec!["emptycommit-2"]);
        assert!(repo.check_invariants().is_empty());
        assert_eq!(repo.sourcetype.as_deref(), Some("svn"));
    }

    #[test]
    fn test_branch_paths_are_root_relative() {
        let repo = lift_text(&simple_dump());
        let commits = commits(&repo);
        // Inside a branch, paths drop the branch prefix.
        let trunk_paths: Vec<String> = commits[0]
            .fileops
            .iter()
            .flat_map(|op| op.paths())
            .map(|p| p.to_string())
            .collect();
        assert_eq!(trunk_paths, vec!["README".to_owned()]);
        // The dev commit's manifest sees the copied README through the
        // parent link, plus its own NEWS.
        let mark = commits[1].mark.clone().unwrap();
        let manifest = repo.manifest(&mark).unwrap();
        assert!(manifest.contains(b"README".as_bstr()));
        assert!(manifest.contains(b"NEWS".as_bstr()));
    }

    #[test]
    fn test_legacy_map_population() {
        let repo = lift_text(&simple_dump());
        assert!(repo.legacy_map.contains_key("1"));
        assert!(repo.legacy_map.contains_key("3"));
    }

    #[test]
    fn test_empty_trunk_add_becomes_root_tag() {
        let mut dump = String::from("SVN-fs-dump-format-version: 2\n\n");
        dump.push_str("Revision-number: 0\nProp-content-length: 56\nContent-length: 56\n\nK 8\nsvn:date\nV 27\n2020-09-13T12:00:00.000000Z\nPROPS-END\n\n");
        dump.push_str(&revision(1, "create trunk", 1, &dir_add("trunk")));
        let repo = lift_text(&dump);
        assert_eq!(commits(&repo).len(), 0);
        let tags = tags(&repo);
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].name, "root");
    }

    #[test]
    fn test_tag_copy_becomes_annotated_tag() {
        let mut dump = simple_dump();
        dump.push_str(&revision(4, "tag it", 3, &dir_copy("tags/v1.0", "trunk", 1)));
        let repo = lift_text(&dump);
        let tags = tags(&repo);
        let v1 = tags.iter().find(|t| t.name == "v1.0").expect("v1.0 tag");
        // Attached to the trunk commit the tag was copied from.
        let target = v1.committish.mark().unwrap();
        let commit = repo.commit_by_mark(target).unwrap();
        assert_eq!(commit.legacy_id.as_deref(), Some("1"));
    }

    #[test]
    fn test_executable_and_symlink_modes() {
        let mut dump = String::from("SVN-fs-dump-format-version: 2\n\n");
        let exec_props = props(&[("svn:executable", "*")]);
        let exec_node = format!(
            "Node-path: trunk/run.sh\nNode-kind: file\nNode-action: add\nProp-content-length: {}\nText-content-length: 3\nContent-length: {}\n\n{}#!\n",
            exec_props.len(),
            exec_props.len() + 3,
            exec_props,
        );
        let link_props = props(&[("svn:special", "*")]);
        let link_node = format!(
            "Node-path: trunk/latest\nNode-kind: file\nNode-action: add\nProp-content-length: {}\nText-content-length: 11\nContent-length: {}\n\n{}link run.sh\n",
            link_props.len(),
            link_props.len() + 11,
            link_props,
        );
        dump.push_str(&revision(
            1,
            "modes",
            0,
            &(dir_add("trunk") + &exec_node + &link_node),
        ));
        let repo = lift_text(&dump);
        let commit = commits(&repo)[0];
        let modes: HashMap<String, String> = commit
            .fileops
            .iter()
            .filter_map(|op| match op {
                FileOp::Modify { mode, path, .. } => {
                    Some((path.to_string(), mode.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(modes["run.sh"], MODE_EXECUTABLE);
        assert_eq!(modes["latest"], MODE_SYMLINK);
        // Symlink content drops the `link ` keyword.
        let link_op = commit
            .fileops
            .iter()
            .find_map(|op| match op {
                FileOp::Modify { path, blobref, .. } if path == "latest" => {
                    blobref.mark().map(str::to_owned)
                }
                _ => None,
            })
            .unwrap();
        let blob = repo.blob_by_mark(&link_op).unwrap();
        assert_eq!(blob.materialize(None).unwrap(), BString::from("run.sh"));
    }

    #[test]
    fn test_svn_ignore_generates_gitignore() {
        let mut dump = String::from("SVN-fs-dump-format-version: 2\n\n");
        let ignore_props = props(&[("svn:ignore", "*.o\nbuild\n")]);
        let node = format!(
            "Node-path: trunk\nNode-kind: dir\nNode-action: add\nProp-content-length: {}\nContent-length: {}\n\n{}",
            ignore_props.len(),
            ignore_props.len(),
            ignore_props,
        );
        dump.push_str(&revision(1, "ignores", 0, &node));
        let repo = lift_text(&dump);
        let commit = commits(&repo)[0];
        let op = commit
            .fileops
            .iter()
            .find_map(|op| match op {
                FileOp::Modify { path, blobref, .. } if path == ".gitignore" => {
                    blobref.mark().map(str::to_owned)
                }
                _ => None,
            })
            .expect("generated .gitignore op");
        let blob = repo.blob_by_mark(&op).unwrap();
        assert_eq!(
            blob.materialize(None).unwrap(),
            BString::from("/*.o\n/build\n")
        );
    }

    #[test]
    fn test_user_ignores_suppresses_generation() {
        let mut dump = String::from("SVN-fs-dump-format-version: 2\n\n");
        let ignore_props = props(&[("svn:ignore", "*.o\n")]);
        let node = format!(
            "Node-path: trunk\nNode-kind: dir\nNode-action: add\nProp-content-length: {}\nContent-length: {}\n\n{}",
            ignore_props.len(),
            ignore_props.len(),
            ignore_props,
        );
        dump.push_str(&revision(1, "ignores", 0, &node));
        let options = ReadOptions {
            user_ignores: true,
            ..Default::default()
        };
        let repo = read_svn_dump(dump.as_bytes(), "test", &options).unwrap();
        let all_commits = commits(&repo);
        // The dir add with only ignore props yields no fileops at all, so
        // the revision tagifies away.
        assert!(all_commits.is_empty() || all_commits[0].fileops.is_empty());
    }

    #[test]
    fn test_nobranch_mode() {
        let options = ReadOptions {
            nobranch: true,
            ..Default::default()
        };
        let repo = read_svn_dump(simple_dump().as_bytes(), "test", &options).unwrap();
        for commit in commits(&repo) {
            assert_eq!(commit.branch, "refs/heads/master");
        }
    }

    #[test]
    fn test_dead_branch_elimination() {
        let mut dump = simple_dump();
        dump.push_str(&revision(
            4,
            "kill dev",
            3,
            "Node-path: branches/dev\nNode-action: delete\n\n",
        ));
        let repo = lift_text(&dump);
        // The dev branch never existed: r2 and r3 are gone entirely.
        for commit in commits(&repo) {
            assert_eq!(commit.branch, "refs/heads/master");
        }
    }

    #[test]
    fn test_preserve_keeps_dead_branches() {
        let mut dump = simple_dump();
        dump.push_str(&revision(
            4,
            "kill dev",
            3,
            "Node-path: branches/dev\nNode-action: delete\n\n",
        ));
        let options = ReadOptions {
            preserve: true,
            ..Default::default()
        };
        let repo = read_svn_dump(dump.as_bytes(), "test", &options).unwrap();
        let branches: Vec<String> = commits(&repo).iter().map(|c| c.branch.clone()).collect();
        assert!(branches.iter().any(|b| b == "refs/heads/dev"));
    }

    #[test]
    fn test_mergeinfo_creates_merge_parent() {
        let mut dump = simple_dump();
        dump.push_str(&revision(
            4,
            "more dev work",
            3,
            &file_add("branches/dev/MORE", "more"),
        ));
        let merge_props = props(&[("svn:mergeinfo", "/branches/dev:2-4\n")]);
        let node = format!(
            "Node-path: trunk\nNode-kind: dir\nNode-action: change\nProp-content-length: {}\nContent-length: {}\n\n{}",
            merge_props.len(),
            merge_props.len(),
            merge_props,
        );
        let merge_rev = revision(5, "merge dev", 4, &(node + &file_add("trunk/MORE", "more")));
        dump.push_str(&merge_rev);
        let repo = lift_text(&dump);
        let merge_commit = commits(&repo)
            .into_iter()
            .find(|c| c.legacy_id.as_deref() == Some("5"))
            .expect("merge commit");
        assert_eq!(merge_commit.parents.len(), 2);
        let second_parent = merge_commit.parent_marks()[1];
        let parent = repo.commit_by_mark(second_parent).unwrap();
        assert_eq!(parent.legacy_id.as_deref(), Some("4"));
    }

    #[test]
    fn test_split_commit_for_multi_branch_revision() {
        let mut dump = simple_dump();
        dump.push_str(&revision(
            4,
            "touch both",
            3,
            &(file_add("trunk/T", "t") + &file_add("branches/dev/D", "d")),
        ));
        let repo = lift_text(&dump);
        let all = commits(&repo);
        let legacies: Vec<&str> = all
            .iter()
            .filter_map(|c| c.legacy_id.as_deref())
            .collect();
        assert!(legacies.contains(&"4"));
        assert!(legacies.contains(&"4.1"));
        let split = all
            .iter()
            .find(|c| c.legacy_id.as_deref() == Some("4.1"))
            .unwrap();
        let main = all
            .iter()
            .find(|c| c.legacy_id.as_deref() == Some("4"))
            .unwrap();
        assert_eq!(split.comment, main.comment);
        assert_ne!(split.branch, main.branch);
    }

    #[test]
    fn test_tipdelete_becomes_tag_under_preserve() {
        let mut dump = simple_dump();
        dump.push_str(&revision(
            4,
            "kill dev",
            3,
            "Node-path: branches/dev\nNode-action: delete\n\n",
        ));
        let options = ReadOptions {
            preserve: true,
            ..Default::default()
        };
        let repo = read_svn_dump(dump.as_bytes(), "test", &options).unwrap();
        let tag_names: Vec<&str> = tags(&repo).iter().map(|t| t.name.as_str()).collect();
        assert!(tag_names.contains(&"tipdelete-dev"));
    }

    #[test]
    fn test_resets_planted_at_tips() {
        let repo = lift_text(&simple_dump());
        let resets: Vec<&Reset> = repo
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Reset(reset) => Some(reset),
                _ => None,
            })
            .collect();
        let names: Vec<&str> = resets.iter().map(|r| r.ref_name.as_str()).collect();
        assert!(names.contains(&"refs/heads/master"));
        assert!(names.contains(&"refs/heads/dev"));
    }

    #[test]
    fn test_marks_renumbered_densely() {
        let repo = lift_text(&simple_dump());
        let mut marks: Vec<u64> = repo
            .events
            .iter()
            .filter_map(Event::mark)
            .map(|m| m.trim_start_matches(':').parse().unwrap())
            .collect();
        marks.sort_unstable();
        let expected: Vec<u64> = (1..=marks.len() as u64).collect();
        assert_eq!(marks, expected);
    }

    #[test]
    fn test_gitignore_content_transform() {
        assert_eq!(
            gitignore_content(b"*.o\nbuild\n/already\n\n".as_bstr()),
            BString::from("/*.o\n/build\n/already\n")
        );
    }

    #[test]
    fn test_cvs2svn_junk_dropped() {
        let mut dump = simple_dump();
        dump.push_str(&revision(
            4,
            "This commit was manufactured by cvs2svn to create branch 'dev'.",
            3,
            &dir_add("branches/other"),
        ));
        let repo = lift_text(&dump);
        assert!(
            !commits(&repo)
                .iter()
                .any(|c| c.comment.contains_str(b"manufactured"))
        );
        assert!(
            !tags(&repo)
                .iter()
                .any(|t| t.comment.contains_str(b"manufactured"))
        );
    }
}
