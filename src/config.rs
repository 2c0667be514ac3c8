use crate::error::command_error;
use anyhow::Context as _;
use anyhow::Result;
use anyhow::bail;
use std::collections::HashMap;
use std::io::BufRead as _;
use std::io::Write as _;
use std::path::Path;

/// Process-wide options. These are explicit state threaded through the
/// operations that need them; nothing here mutates behind the caller's back.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    /// Deterministic output with synthetic identity, for tests.
    pub testmode: bool,
    /// Gzip blob spill files.
    pub compressblobs: bool,
    /// Verbose phase timings.
    pub bigprofile: bool,
}

/// Options consumed by the stream reader and the Subversion lifter.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Disable dead-branch elimination (lifter pass 0).
    pub preserve: bool,
    /// Disable SVN branch analysis; everything lands on refs/heads/master.
    pub nobranch: bool,
    /// Suppress property-echo gripes.
    pub ignore_properties: bool,
    /// Pass user .gitignore files through instead of generating them from
    /// svn:ignore.
    pub user_ignores: bool,
    /// Use the SVN repository UUID as the email domain of synthesized
    /// authors.
    pub use_uuid: bool,
    /// Normalize CRLF to LF and trim whitespace in imported comments.
    pub canonicalize: bool,
}

impl ReadOptions {
    pub fn from_flags<'a>(flags: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut opts = Self::default();
        for flag in flags {
            match flag {
                "--preserve" => opts.preserve = true,
                "--nobranch" => opts.nobranch = true,
                "--ignore-properties" => opts.ignore_properties = true,
                "--user-ignores" => opts.user_ignores = true,
                "--use-uuid" => opts.use_uuid = true,
                "--canonicalize" => opts.canonicalize = true,
                other => return Err(command_error(format!("unknown read option {other}"))),
            }
        }
        Ok(opts)
    }
}

/// Options consumed by the fast-import serializer.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Append `Legacy-ID: ...` to emitted commit and tag comments.
    pub legacy: bool,
    /// Emit action-stamp callouts for parents outside the selection.
    pub callout: bool,
    /// Suppress `reset <branch>^0` for branch tips outside the selection.
    pub noincremental: bool,
}

impl WriteOptions {
    pub fn from_flags<'a>(flags: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut opts = Self::default();
        for flag in flags {
            match flag {
                "--legacy" => opts.legacy = true,
                "--callout" => opts.callout = true,
                "--noincremental" => opts.noincremental = true,
                other => return Err(command_error(format!("unknown write option {other}"))),
            }
        }
        Ok(opts)
    }
}

/// Policy flags controlling squash/delete side-effect propagation.
#[derive(Debug, Clone, Default)]
pub struct SquashPolicy {
    pub delete: bool,
    pub pushback: bool,
    pub pushforward: bool,
    pub tagify: bool,
    pub tagback: bool,
    pub tagforward: bool,
    pub coalesce: bool,
    pub empty_only: bool,
    pub complain: bool,
    pub quiet: bool,
}

impl SquashPolicy {
    pub fn from_flags<'a>(flags: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut policy = Self::default();
        for flag in flags {
            match flag {
                "--delete" => policy.delete = true,
                "--pushback" => policy.pushback = true,
                "--pushforward" => policy.pushforward = true,
                "--tagify" => policy.tagify = true,
                "--tagback" => policy.tagback = true,
                "--tagforward" => policy.tagforward = true,
                "--coalesce" => policy.coalesce = true,
                "--empty-only" => policy.empty_only = true,
                "--complain" => policy.complain = true,
                "--quiet" => policy.quiet = true,
                other => return Err(command_error(format!("unknown squash option {other}"))),
            }
        }
        if policy.pushback && policy.pushforward {
            return Err(command_error(
                "--pushback and --pushforward are mutually exclusive",
            ));
        }
        if policy.tagback && policy.tagforward {
            return Err(command_error(
                "--tagback and --tagforward are mutually exclusive",
            ));
        }
        Ok(policy)
    }

    /// Fileops of deleted commits move forward unless told otherwise.
    pub fn effective_pushforward(&self) -> bool {
        !self.delete && !self.pushback
    }

    /// Attachments retarget to the first child unless told otherwise.
    pub fn effective_tagforward(&self) -> bool {
        self.tagforward || (!self.delete && !self.tagback)
    }
}

/// One author-map principal with optional alias identities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorEntry {
    pub name: String,
    pub email: String,
    pub timezone: Option<String>,
    /// Additional `(name, email)` identities attached with `+` lines.
    pub aliases: Vec<(String, String)>,
}

/// The author map: local VCS identities to full attributions.
///
/// Syntax, one entry per non-comment line:
/// `<local-id> = <Full Name> <email> [<timezone>]`, with a leading `+`
/// starting an alias line for the preceding principal and `#` starting a
/// comment.
#[derive(Debug, Clone, Default)]
pub struct AuthorMap {
    pub entries: HashMap<String, AuthorEntry>,
    order: Vec<String>,
}

impl AuthorMap {
    pub fn read(input: impl std::io::Read) -> Result<Self> {
        let mut map = Self::default();
        let mut last: Option<String> = None;
        for (lineno, line) in std::io::BufReader::new(input).lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(alias) = line.strip_prefix('+') {
                let Some(principal) = &last else {
                    bail!("author map line {}: alias with no principal", lineno + 1);
                };
                let (name, email, _) = parse_identity(alias.trim())
                    .with_context(|| format!("author map line {}", lineno + 1))?;
                map.entries
                    .get_mut(principal)
                    .unwrap()
                    .aliases
                    .push((name, email));
                continue;
            }
            let Some((local, identity)) = line.split_once('=') else {
                bail!("author map line {}: missing '='", lineno + 1);
            };
            let local = local.trim().to_owned();
            let (name, email, timezone) = parse_identity(identity.trim())
                .with_context(|| format!("author map line {}", lineno + 1))?;
            map.order.push(local.clone());
            last = Some(local.clone());
            map.entries.insert(
                local,
                AuthorEntry {
                    name,
                    email,
                    timezone,
                    aliases: Vec::new(),
                },
            );
        }
        Ok(map)
    }

    pub fn read_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening author map {}", path.display()))?;
        Self::read(file)
    }

    pub fn write(&self, mut out: impl std::io::Write) -> Result<()> {
        for local in &self.order {
            let entry = &self.entries[local];
            match &entry.timezone {
                Some(tz) => writeln!(out, "{} = {} <{}> {}", local, entry.name, entry.email, tz)?,
                None => writeln!(out, "{} = {} <{}>", local, entry.name, entry.email)?,
            }
            for (name, email) in &entry.aliases {
                writeln!(out, "+ {name} <{email}>")?;
            }
        }
        Ok(())
    }

    pub fn get(&self, local: &str) -> Option<&AuthorEntry> {
        self.entries.get(local)
    }
}

/// Parses `Full Name <email> [tz]`.
fn parse_identity(s: &str) -> Result<(String, String, Option<String>)> {
    let Some(lt) = s.find('<') else {
        bail!("identity {s:?} lacks an email address");
    };
    let Some(gt) = s[lt..].find('>').map(|i| lt + i) else {
        bail!("identity {s:?} has an unterminated email");
    };
    let name = s[..lt].trim().to_owned();
    let email = s[lt + 1..gt].trim().to_owned();
    let tz = s[gt + 1..].trim();
    let timezone = (!tz.is_empty()).then(|| tz.to_owned());
    Ok((name, email, timezone))
}

/// The legacy map: tab-separated `<legacy-id>\t<action-stamp>` lines, with
/// an optional `:N` ordinal suffix on the stamp disambiguating collisions.
#[derive(Debug, Clone, Default)]
pub struct LegacyMap {
    pub entries: Vec<(String, String)>,
}

impl LegacyMap {
    pub fn read(input: impl std::io::Read) -> Result<Self> {
        let mut map = Self::default();
        for (lineno, line) in std::io::BufReader::new(input).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((legacy, stamp)) = line.split_once('\t') else {
                bail!("legacy map line {}: missing tab separator", lineno + 1);
            };
            map.entries.push((legacy.to_owned(), stamp.to_owned()));
        }
        Ok(map)
    }

    pub fn write(&self, mut out: impl std::io::Write) -> Result<()> {
        for (legacy, stamp) in &self.entries {
            writeln!(out, "{legacy}\t{stamp}")?;
        }
        Ok(())
    }
}

/// Branchify patterns decide which Subversion directories act as branches.
/// A path matches when (a) it equals a literal pattern, (b) it is an
/// immediate child of a pattern ending in `/*`, or (c) it is a top-level
/// directory and `*` is in the list.
#[derive(Debug, Clone)]
pub struct BranchifyPatterns {
    pub patterns: Vec<String>,
}

impl Default for BranchifyPatterns {
    fn default() -> Self {
        Self {
            patterns: vec![
                "trunk".to_owned(),
                "tags/*".to_owned(),
                "branches/*".to_owned(),
            ],
        }
    }
}

impl BranchifyPatterns {
    pub fn matches(&self, path: &str) -> bool {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return false;
        }
        for pattern in &self.patterns {
            if pattern == "*" {
                if !path.contains('/') {
                    return true;
                }
            } else if let Some(parent) = pattern.strip_suffix("/*") {
                if let Some(rest) = path.strip_prefix(parent)
                    && let Some(child) = rest.strip_prefix('/')
                    && !child.is_empty()
                    && !child.contains('/')
                {
                    return true;
                }
            } else if path == pattern {
                return true;
            }
        }
        false
    }

    /// The longest pattern-matching prefix of `path` that names a branch,
    /// e.g. `branches/dev` for `branches/dev/src/main.c`.
    pub fn branch_of<'a>(&self, path: &'a str) -> Option<&'a str> {
        let path = path.trim_matches('/');
        let mut best: Option<&str> = None;
        let mut end = 0;
        for (i, ch) in path.char_indices().chain([(path.len(), '/')]) {
            if ch != '/' {
                continue;
            }
            let prefix = &path[..i];
            if self.matches(prefix) && prefix.len() > end {
                best = Some(prefix);
                end = prefix.len();
            }
        }
        best
    }
}

/// Ordered `/regex/replacement/` rules renaming lifted branches; first
/// match wins.
#[derive(Debug, Clone, Default)]
pub struct BranchMap {
    rules: Vec<(regex::Regex, String)>,
}

impl BranchMap {
    pub fn parse(lines: &[String]) -> Result<Self> {
        let mut rules = Vec::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(stripped) = line.strip_prefix('/').and_then(|l| l.strip_suffix('/')) else {
                bail!("branch map rule {line:?} is not /regex/replacement/");
            };
            // The field separator is an unescaped slash; `\/` passes through.
            let Some((pattern, replacement)) = split_unescaped_slash(stripped) else {
                bail!("branch map rule {line:?} lacks a replacement");
            };
            let regex = regex::Regex::new(&pattern)
                .with_context(|| format!("branch map rule {line:?}"))?;
            rules.push((regex, replacement));
        }
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Applies the first matching rule, or returns the input unchanged.
    pub fn rename(&self, branch: &str) -> String {
        for (regex, replacement) in &self.rules {
            if regex.is_match(branch) {
                return regex.replace(branch, replacement.as_str()).into_owned();
            }
        }
        branch.to_owned()
    }
}

/// Splits `a/b` at the first slash not preceded by a backslash, unescaping
/// `\/` in both halves.
fn split_unescaped_slash(s: &str) -> Option<(String, String)> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'/' => {
                let left = s[..i].replace("\\/", "/");
                let right = s[i + 1..].replace("\\/", "/");
                return Some((left, right));
            }
            _ => i += 1,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_read_options() {
        let opts = ReadOptions::from_flags(["--preserve", "--use-uuid"]).unwrap();
        assert!(opts.preserve);
        assert!(opts.use_uuid);
        assert!(!opts.nobranch);
        assert!(ReadOptions::from_flags(["--bogus"]).is_err());
    }

    #[test]
    fn test_squash_policy_validation() {
        assert!(SquashPolicy::from_flags(["--pushback", "--pushforward"]).is_err());
        let policy = SquashPolicy::from_flags(["--delete"]).unwrap();
        assert!(!policy.effective_pushforward());
        assert!(!policy.effective_tagforward());
        let policy = SquashPolicy::from_flags([]).unwrap();
        assert!(policy.effective_pushforward());
        assert!(policy.effective_tagforward());
        let policy = SquashPolicy::from_flags(["--tagback"]).unwrap();
        assert!(!policy.effective_tagforward());
    }

    #[test]
    fn test_author_map_round_trip() {
        let text = "\
# principal identities
esr = Eric S. Raymond <esr@thyrsus.com> America/New_York
+ Eric Raymond <esr@snark.thyrsus.com>
jrh = J. Random Hacker <jrh@example.com>
";
        let map = AuthorMap::read(text.as_bytes()).unwrap();
        let esr = map.get("esr").unwrap();
        assert_eq!(esr.name, "Eric S. Raymond");
        assert_eq!(esr.timezone.as_deref(), Some("America/New_York"));
        assert_eq!(esr.aliases.len(), 1);
        let mut out = Vec::new();
        map.write(&mut out).unwrap();
        let text2 = String::from_utf8(out).unwrap();
        assert!(text2.contains("esr = Eric S. Raymond <esr@thyrsus.com> America/New_York"));
        assert!(text2.contains("+ Eric Raymond <esr@snark.thyrsus.com>"));
    }

    #[test]
    fn test_author_map_bad_alias() {
        assert!(AuthorMap::read("+ A <a@x>\n".as_bytes()).is_err());
    }

    #[test]
    fn test_legacy_map() {
        let map = LegacyMap::read("SVN:123\t2020-09-13T12:26:40Z!a@x\n".as_bytes()).unwrap();
        assert_eq!(map.entries.len(), 1);
        assert_eq!(map.entries[0].0, "SVN:123");
    }

    #[test]
    fn test_branchify_matching() {
        let patterns = BranchifyPatterns::default();
        assert!(patterns.matches("trunk"));
        assert!(patterns.matches("branches/dev"));
        assert!(patterns.matches("tags/v1.0"));
        assert!(!patterns.matches("branches"));
        assert!(!patterns.matches("branches/dev/sub"));
        assert!(!patterns.matches("random"));
    }

    #[test]
    fn test_branchify_star() {
        let patterns = BranchifyPatterns {
            patterns: vec!["*".to_owned()],
        };
        assert!(patterns.matches("project1"));
        assert!(!patterns.matches("project1/sub"));
    }

    #[test]
    fn test_branch_of() {
        let patterns = BranchifyPatterns::default();
        assert_eq!(patterns.branch_of("trunk/src/main.c"), Some("trunk"));
        assert_eq!(patterns.branch_of("branches/dev/x"), Some("branches/dev"));
        assert_eq!(patterns.branch_of("branches/dev"), Some("branches/dev"));
        assert_eq!(patterns.branch_of("unrelated/x"), None);
    }

    #[test]
    fn test_branch_map() {
        let map = BranchMap::parse(&["/^trunk$/refs\\/heads\\/main/".to_owned()]).unwrap();
        assert_eq!(map.rename("trunk"), "refs/heads/main");
        assert_eq!(map.rename("other"), "other");
        assert!(BranchMap::parse(&["bogus".to_owned()]).is_err());
    }
}
