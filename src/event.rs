use crate::attribution::Attribution;
use crate::orderedset::OrderedMap;
use crate::util::path_needs_quoting;
use crate::util::quote_path;
use anyhow::Context as _;
use anyhow::Result;
use anyhow::bail;
use bstr::BStr;
use bstr::BString;
use bstr::ByteSlice as _;
use sha1::Digest as _;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::io::Read as _;
use std::io::Seek as _;
use std::path::PathBuf;

pub const MODE_NORMAL: &str = "100644";
pub const MODE_EXECUTABLE: &str = "100755";
pub const MODE_SYMLINK: &str = "120000";
pub const MODE_DIRECTORY: &str = "040000";
pub const MODE_SUBMODULE: &str = "160000";

pub fn is_valid_mode(mode: &str) -> bool {
    matches!(
        mode,
        MODE_NORMAL | MODE_EXECUTABLE | MODE_SYMLINK | MODE_DIRECTORY | MODE_SUBMODULE
    )
}

/// A reference from a fileop to file content: either a marked blob or an
/// inline payload carried on the op itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobRef {
    Mark(String),
    Inline(BString),
}

impl BlobRef {
    pub fn mark(&self) -> Option<&str> {
        match self {
            BlobRef::Mark(mark) => Some(mark),
            BlobRef::Inline(_) => None,
        }
    }
}

/// A reference to a commit: a mark for in-repository parents, or an action
/// stamp callout for parents that live outside the current repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Committish {
    Mark(String),
    Callout(String),
}

impl Committish {
    pub fn mark(&self) -> Option<&str> {
        match self {
            Committish::Mark(mark) => Some(mark),
            Committish::Callout(_) => None,
        }
    }

    pub fn emit(&self) -> &str {
        match self {
            Committish::Mark(mark) => mark,
            Committish::Callout(stamp) => stamp,
        }
    }
}

/// A per-commit file modification record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOp {
    Modify {
        mode: String,
        blobref: BlobRef,
        path: BString,
    },
    Delete {
        path: BString,
    },
    Rename {
        source: BString,
        target: BString,
    },
    Copy {
        source: BString,
        target: BString,
    },
    Note {
        blobref: BlobRef,
        path: BString,
    },
    DeleteAll,
}

impl FileOp {
    pub fn modify(mode: &str, mark: impl Into<String>, path: impl Into<BString>) -> Self {
        FileOp::Modify {
            mode: mode.to_owned(),
            blobref: BlobRef::Mark(mark.into()),
            path: path.into(),
        }
    }

    pub fn delete(path: impl Into<BString>) -> Self {
        FileOp::Delete { path: path.into() }
    }

    /// The paths this op touches, in operand order.
    pub fn paths(&self) -> Vec<&BStr> {
        match self {
            FileOp::Modify { path, .. }
            | FileOp::Delete { path }
            | FileOp::Note { path, .. } => vec![path.as_bstr()],
            FileOp::Rename { source, target } | FileOp::Copy { source, target } => {
                vec![source.as_bstr(), target.as_bstr()]
            }
            FileOp::DeleteAll => vec![],
        }
    }

    /// The path the op leaves visible, if any.
    pub fn target_path(&self) -> Option<&BStr> {
        match self {
            FileOp::Modify { path, .. } | FileOp::Note { path, .. } => Some(path.as_bstr()),
            FileOp::Rename { target, .. } | FileOp::Copy { target, .. } => Some(target.as_bstr()),
            FileOp::Delete { .. } | FileOp::DeleteAll => None,
        }
    }

    pub fn is_deleteall(&self) -> bool {
        matches!(self, FileOp::DeleteAll)
    }

    pub fn blob_mark(&self) -> Option<&str> {
        match self {
            FileOp::Modify { blobref, .. } | FileOp::Note { blobref, .. } => blobref.mark(),
            _ => None,
        }
    }

    /// Inline payload length when the op carries one, used by the serializer.
    pub fn inline_data(&self) -> Option<&BStr> {
        match self {
            FileOp::Modify {
                blobref: BlobRef::Inline(data),
                ..
            }
            | FileOp::Note {
                blobref: BlobRef::Inline(data),
                ..
            } => Some(data.as_bstr()),
            _ => None,
        }
    }

    /// The op line in fast-import form, without any inline data section.
    pub fn emit_line(&self) -> BString {
        fn quoted(path: &BStr) -> BString {
            if path_needs_quoting(path) {
                quote_path(path)
            } else {
                path.to_owned()
            }
        }
        let mut out = BString::from("");
        match self {
            FileOp::Modify {
                mode,
                blobref,
                path,
            } => {
                out.extend_from_slice(b"M ");
                out.extend_from_slice(mode.as_bytes());
                out.extend_from_slice(b" ");
                match blobref {
                    BlobRef::Mark(mark) => out.extend_from_slice(mark.as_bytes()),
                    BlobRef::Inline(_) => out.extend_from_slice(b"inline"),
                }
                out.extend_from_slice(b" ");
                out.extend_from_slice(&quoted(path.as_bstr()));
            }
            FileOp::Delete { path } => {
                out.extend_from_slice(b"D ");
                out.extend_from_slice(&quoted(path.as_bstr()));
            }
            FileOp::Rename { source, target } => {
                out.extend_from_slice(b"R ");
                out.extend_from_slice(&quote_path(source.as_bstr()));
                out.extend_from_slice(b" ");
                out.extend_from_slice(&quote_path(target.as_bstr()));
            }
            FileOp::Copy { source, target } => {
                out.extend_from_slice(b"C ");
                out.extend_from_slice(&quote_path(source.as_bstr()));
                out.extend_from_slice(b" ");
                out.extend_from_slice(&quote_path(target.as_bstr()));
            }
            FileOp::Note { blobref, path } => {
                out.extend_from_slice(b"N ");
                match blobref {
                    BlobRef::Mark(mark) => out.extend_from_slice(mark.as_bytes()),
                    BlobRef::Inline(_) => out.extend_from_slice(b"inline"),
                }
                out.extend_from_slice(b" ");
                out.extend_from_slice(&quoted(path.as_bstr()));
            }
            FileOp::DeleteAll => out.extend_from_slice(b"deleteall"),
        }
        out
    }
}

/// Orders paths so that files inside a directory sort before the directory's
/// siblings that are its prefix: `a/b/c < a/b < a`. A slash sorts below every
/// other byte for comparison purposes.
pub fn path_cmp_deep_first(a: &BStr, b: &BStr) -> Ordering {
    let a_parts: Vec<&[u8]> = a.split_str(b"/").collect();
    let b_parts: Vec<&[u8]> = b.split_str(b"/").collect();
    for (pa, pb) in a_parts.iter().zip(b_parts.iter()) {
        match pa.cmp(pb) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    // One is a path prefix of the other; the deeper path sorts first.
    b_parts.len().cmp(&a_parts.len())
}

/// Where a blob's bytes currently live.
#[derive(Debug, Clone)]
pub enum BlobBody {
    /// Bytes held in memory.
    Memory(BString),
    /// A byte range in the source stream file, read on demand.
    Range { start: u64, len: u64 },
    /// A spill file under the repository scratch directory.
    Spilled { path: PathBuf, gzipped: bool },
}

/// Legacy-reference cookie recovered from `$Id$`-style keywords in blob
/// content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub path: BString,
    pub rev: String,
}

#[derive(Debug, Clone)]
pub struct Blob {
    pub mark: String,
    pub body: BlobBody,
    pub cookie: Option<Cookie>,
    digest: RefCell<Option<(u64, String)>>,
}

impl Blob {
    pub fn new(mark: impl Into<String>, body: BlobBody) -> Self {
        Self {
            mark: mark.into(),
            body,
            cookie: None,
            digest: RefCell::new(None),
        }
    }

    /// The blob's byte content. Range bodies are fetched from the retained
    /// source stream handle; spilled bodies from their scratch file.
    pub fn materialize(&self, source: Option<&RefCell<std::fs::File>>) -> Result<BString> {
        match &self.body {
            BlobBody::Memory(data) => Ok(data.clone()),
            BlobBody::Range { start, len } => {
                let source =
                    source.with_context(|| format!("blob {} has no source stream", self.mark))?;
                let mut file = source.borrow_mut();
                file.seek(std::io::SeekFrom::Start(*start))?;
                let mut buf = vec![0u8; *len as usize];
                file.read_exact(&mut buf)
                    .with_context(|| format!("reading blob {} from source stream", self.mark))?;
                Ok(buf.into())
            }
            BlobBody::Spilled { path, gzipped } => {
                let file = std::fs::File::open(path)
                    .with_context(|| format!("opening spill file for blob {}", self.mark))?;
                let mut buf = Vec::new();
                if *gzipped {
                    flate2::read::GzDecoder::new(file).read_to_end(&mut buf)?;
                } else {
                    std::io::BufReader::new(file).read_to_end(&mut buf)?;
                }
                Ok(buf.into())
            }
        }
    }

    /// Size and SHA-1 of the content, computed lazily for deduplication.
    pub fn size_and_digest(&self, source: Option<&RefCell<std::fs::File>>) -> Result<(u64, String)> {
        if let Some(cached) = self.digest.borrow().as_ref() {
            return Ok(cached.clone());
        }
        let content = self.materialize(source)?;
        let mut hasher = sha1::Sha1::new();
        hasher.update(&content);
        let result = (content.len() as u64, hex::encode(hasher.finalize()));
        *self.digest.borrow_mut() = Some(result.clone());
        Ok(result)
    }

    pub fn invalidate_digest(&self) {
        *self.digest.borrow_mut() = None;
    }
}

#[derive(Debug, Clone)]
pub struct Commit {
    pub mark: Option<String>,
    pub branch: String,
    pub committer: Attribution,
    /// Author attributions in stream order; may be empty.
    pub authors: Vec<Attribution>,
    pub comment: BString,
    pub parents: Vec<Committish>,
    /// Marks of child commits, maintained reciprocally with `parents` by the
    /// repository's structural mutators.
    pub children: Vec<String>,
    pub fileops: Vec<FileOp>,
    pub properties: OrderedMap<BString>,
    /// Identifier preserved from the source system, e.g. a Subversion
    /// revision number with an optional `.N` split suffix.
    pub legacy_id: Option<String>,
}

impl Commit {
    pub fn new(branch: impl Into<String>, committer: Attribution) -> Self {
        Self {
            mark: None,
            branch: branch.into(),
            committer,
            authors: Vec::new(),
            comment: BString::from(""),
            parents: Vec::new(),
            children: Vec::new(),
            fileops: Vec::new(),
            properties: OrderedMap::new(),
            legacy_id: None,
        }
    }

    pub fn first_parent_mark(&self) -> Option<&str> {
        self.parents.first().and_then(|p| p.mark())
    }

    pub fn parent_marks(&self) -> Vec<&str> {
        self.parents.iter().filter_map(|p| p.mark()).collect()
    }

    pub fn has_parent_mark(&self, mark: &str) -> bool {
        self.parents.iter().any(|p| p.mark() == Some(mark))
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    pub fn has_callouts(&self) -> bool {
        self.parents
            .iter()
            .any(|p| matches!(p, Committish::Callout(_)))
    }

    pub fn action_stamp(&self) -> String {
        self.committer.action_stamp()
    }

    /// True when the commit has no fileops at all.
    pub fn is_empty(&self) -> bool {
        self.fileops.is_empty()
    }

    /// True when the only content is a tree-clearing `deleteall`, i.e. a
    /// Subversion tip delete.
    pub fn is_tipdelete(&self) -> bool {
        self.fileops.len() == 1 && self.fileops[0].is_deleteall()
    }

    /// True when every fileop is a deletion.
    pub fn all_deletes(&self) -> bool {
        !self.fileops.is_empty()
            && self
                .fileops
                .iter()
                .all(|op| matches!(op, FileOp::Delete { .. } | FileOp::DeleteAll))
    }
}

#[derive(Debug, Clone)]
pub struct Tag {
    pub name: String,
    pub tagger: Option<Attribution>,
    pub comment: BString,
    pub committish: Committish,
    pub legacy_id: Option<String>,
}

impl Tag {
    pub fn new(name: impl Into<String>, committish: Committish) -> Self {
        Self {
            name: name.into(),
            tagger: None,
            comment: BString::from(""),
            committish,
            legacy_id: None,
        }
    }

    /// The full ref name of the tag.
    pub fn ref_name(&self) -> String {
        format!("refs/tags/{}", self.name)
    }
}

#[derive(Debug, Clone)]
pub struct Reset {
    pub ref_name: String,
    pub committish: Option<Committish>,
}

impl Reset {
    pub fn new(ref_name: impl Into<String>, committish: Option<Committish>) -> Self {
        Self {
            ref_name: ref_name.into(),
            committish,
        }
    }
}

/// A source-stream line preserved verbatim through import and export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Passthrough {
    pub text: BString,
}

/// A stub parent for a commit whose real parent lives in another repository,
/// identified by action stamp. Created by cut operations; resolved back to a
/// real parent link if the referenced commit is later loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callout {
    pub stamp: String,
}

#[derive(Debug, Clone)]
pub enum Event {
    Blob(Blob),
    Commit(Commit),
    Tag(Tag),
    Reset(Reset),
    Passthrough(Passthrough),
    Callout(Callout),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Blob(_) => "blob",
            Event::Commit(_) => "commit",
            Event::Tag(_) => "tag",
            Event::Reset(_) => "reset",
            Event::Passthrough(_) => "passthrough",
            Event::Callout(_) => "callout",
        }
    }

    pub fn mark(&self) -> Option<&str> {
        match self {
            Event::Blob(blob) => Some(&blob.mark),
            Event::Commit(commit) => commit.mark.as_deref(),
            _ => None,
        }
    }

    pub fn set_mark(&mut self, mark: String) -> Result<()> {
        match self {
            Event::Blob(blob) => blob.mark = mark,
            Event::Commit(commit) => commit.mark = Some(mark),
            other => bail!("cannot set a mark on a {} event", other.kind()),
        }
        Ok(())
    }

    pub fn as_commit(&self) -> Option<&Commit> {
        match self {
            Event::Commit(commit) => Some(commit),
            _ => None,
        }
    }

    pub fn as_commit_mut(&mut self) -> Option<&mut Commit> {
        match self {
            Event::Commit(commit) => Some(commit),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Blob> {
        match self {
            Event::Blob(blob) => Some(blob),
            _ => None,
        }
    }

    pub fn as_tag(&self) -> Option<&Tag> {
        match self {
            Event::Tag(tag) => Some(tag),
            _ => None,
        }
    }
}

/// One entry of a commit manifest: what is visible at a path after the
/// commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub mode: String,
    pub blobref: BlobRef,
}

pub type Manifest = crate::pathmap::PathMap<ManifestEntry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date::Date;

    fn test_committer() -> Attribution {
        Attribution::new("A", "a@x", Date::parse("1600000000 +0000").unwrap())
    }

    #[test]
    fn test_fileop_emit_plain() {
        let op = FileOp::modify(MODE_NORMAL, ":1", "README");
        assert_eq!(op.emit_line(), BString::from("M 100644 :1 README"));
        let op = FileOp::delete("src/main.rs");
        assert_eq!(op.emit_line(), BString::from("D src/main.rs"));
        assert_eq!(FileOp::DeleteAll.emit_line(), BString::from("deleteall"));
    }

    #[test]
    fn test_fileop_emit_quoted() {
        let op = FileOp::modify(MODE_NORMAL, ":1", "has space.txt");
        assert_eq!(op.emit_line(), BString::from("M 100644 :1 \"has space.txt\""));
        let op = FileOp::Rename {
            source: "a".into(),
            target: "b".into(),
        };
        assert_eq!(op.emit_line(), BString::from("R \"a\" \"b\""));
    }

    #[test]
    fn test_fileop_inline_emit() {
        let op = FileOp::Modify {
            mode: MODE_NORMAL.to_owned(),
            blobref: BlobRef::Inline("xyz".into()),
            path: "f".into(),
        };
        assert_eq!(op.emit_line(), BString::from("M 100644 inline f"));
        assert_eq!(op.inline_data().unwrap().as_bytes(), b"xyz");
    }

    #[test]
    fn test_path_cmp_deep_first() {
        let cmp = |a: &str, b: &str| path_cmp_deep_first(a.as_bytes().as_bstr(), b.as_bytes().as_bstr());
        assert_eq!(cmp("a/b/c", "a/b"), Ordering::Less);
        assert_eq!(cmp("a/b", "a"), Ordering::Less);
        assert_eq!(cmp("a", "a/b/c"), Ordering::Greater);
        assert_eq!(cmp("a/b", "a/c"), Ordering::Less);
        assert_eq!(cmp("x", "y"), Ordering::Less);
        assert_eq!(cmp("a/b", "a/b"), Ordering::Equal);
    }

    #[test]
    fn test_commit_classification() {
        let mut commit = Commit::new("refs/heads/master", test_committer());
        assert!(commit.is_empty());
        assert!(!commit.is_tipdelete());
        commit.fileops.push(FileOp::DeleteAll);
        assert!(commit.is_tipdelete());
        assert!(commit.all_deletes());
        commit.fileops.push(FileOp::modify(MODE_NORMAL, ":1", "f"));
        assert!(!commit.is_tipdelete());
        assert!(!commit.all_deletes());
    }

    #[test]
    fn test_blob_memory_digest() {
        let blob = Blob::new(":1", BlobBody::Memory("hello\n".into()));
        let (size, sha) = blob.size_and_digest(None).unwrap();
        assert_eq!(size, 6);
        // Well-known SHA-1 of "hello\n".
        assert_eq!(sha, "f572d396fae9206628714fb2ce00f72e94f2258f");
    }
}
