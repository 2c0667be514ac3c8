use crate::config::WriteOptions;
use crate::event::Commit;
use crate::event::Committish;
use crate::event::Event;
use crate::orderedset::OrderedIntSet;
use crate::orderedset::OrderedStringSet;
use crate::repository::Repository;
use anyhow::Context as _;
use anyhow::Result;
use bstr::ByteSlice as _;
use itertools::Itertools as _;
use std::collections::HashSet;
use std::io::Write;

/// Emits the repository (or the selected subset of its events) as a
/// fast-import stream in event order.
pub fn write_stream(
    repo: &Repository,
    selection: Option<&OrderedIntSet>,
    options: &WriteOptions,
    out: &mut (impl Write + ?Sized),
) -> Result<()> {
    let indices: Vec<usize> = match selection {
        Some(selection) => selection.iter().sorted_unstable().collect(),
        None => (0..repo.events.len()).collect(),
    };
    let selected_marks: HashSet<&str> = indices
        .iter()
        .filter_map(|&i| repo.events.get(i).and_then(Event::mark))
        .collect();
    let mut realized = OrderedStringSet::new();

    for &index in &indices {
        let event = repo
            .events
            .get(index)
            .with_context(|| format!("selection index {index} out of range"))?;
        match event {
            Event::Blob(blob) => {
                let content = blob.materialize(repo.source_handle.as_ref())?;
                writeln!(out, "blob")?;
                writeln!(out, "mark {}", blob.mark)?;
                writeln!(out, "data {}", content.len())?;
                out.write_all(&content)?;
                writeln!(out)?;
            }
            Event::Commit(commit) => {
                write_commit(repo, commit, &selected_marks, &mut realized, options, out)?;
            }
            Event::Tag(tag) => {
                writeln!(out, "tag {}", tag.name)?;
                writeln!(out, "from {}", resolve_committish(repo, &tag.committish))?;
                if let Some(tagger) = &tag.tagger {
                    writeln!(out, "tagger {}", tagger.emit())?;
                }
                let comment =
                    cooked_comment(tag.comment.as_bstr(), tag.legacy_id.as_deref(), options);
                writeln!(out, "data {}", comment.len())?;
                out.write_all(&comment)?;
                writeln!(out)?;
            }
            Event::Reset(reset) => {
                writeln!(out, "reset {}", reset.ref_name)?;
                if let Some(committish) = &reset.committish {
                    writeln!(out, "from {}", resolve_committish(repo, committish))?;
                }
                writeln!(out)?;
            }
            Event::Passthrough(passthrough) => {
                out.write_all(&passthrough.text)?;
                writeln!(out)?;
            }
            Event::Callout(callout) => {
                log::warn!(
                    "callout {} has no stream representation, skipped",
                    callout.stamp
                );
            }
        }
    }
    Ok(())
}

/// A committish in stream form: marks stay marks, callouts emit their
/// action stamp.
fn resolve_committish(_repo: &Repository, committish: &Committish) -> String {
    committish.emit().to_owned()
}

/// Comments are normalized to LF termination on the way out; this is one of
/// the two documented round-trip normalizations.
fn cooked_comment(
    comment: &bstr::BStr,
    legacy_id: Option<&str>,
    options: &WriteOptions,
) -> bstr::BString {
    let mut out: bstr::BString = comment.to_owned();
    if !out.is_empty() && !out.ends_with(b"\n") {
        out.push(b'\n');
    }
    if options.legacy
        && let Some(legacy) = legacy_id
    {
        out.extend_from_slice(format!("\nLegacy-ID: {legacy}\n").as_bytes());
    }
    out
}

fn write_commit(
    repo: &Repository,
    commit: &Commit,
    selected_marks: &HashSet<&str>,
    realized: &mut OrderedStringSet,
    options: &WriteOptions,
    out: &mut (impl Write + ?Sized),
) -> Result<()> {
    // A commit whose branch tip precedes the selection needs an incremental
    // `reset <branch>^0` so an importer applies it on top of existing
    // history.
    if !realized.contains(&commit.branch) {
        let parent_outside = commit
            .first_parent_mark()
            .is_some_and(|mark| !selected_marks.contains(mark));
        if parent_outside && !options.noincremental {
            writeln!(out, "reset {}^0", commit.branch)?;
        }
        realized.push(commit.branch.clone());
    }

    writeln!(out, "commit {}", commit.branch)?;
    if let Some(mark) = &commit.mark {
        writeln!(out, "mark {mark}")?;
    }
    for author in &commit.authors {
        writeln!(out, "author {}", author.emit())?;
    }
    writeln!(out, "committer {}", commit.committer.emit())?;
    let comment = cooked_comment(
        commit.comment.as_bstr(),
        commit.legacy_id.as_deref(),
        options,
    );
    writeln!(out, "data {}", comment.len())?;
    out.write_all(&comment)?;

    let mut first = true;
    for parent in &commit.parents {
        let reference = match parent {
            Committish::Mark(mark) if selected_marks.contains(mark.as_str()) => mark.clone(),
            Committish::Mark(mark) => {
                if options.callout {
                    match repo.commit_by_mark(mark) {
                        Some(parent_commit) => parent_commit.action_stamp(),
                        None => {
                            log::warn!("dangling parent {mark} dropped during write");
                            continue;
                        }
                    }
                } else {
                    log::warn!("parent {mark} outside selection dropped; use --callout to keep it");
                    continue;
                }
            }
            Committish::Callout(stamp) => stamp.clone(),
        };
        writeln!(out, "{} {}", if first { "from" } else { "merge" }, reference)?;
        first = false;
    }

    for (name, value) in commit.properties.iter() {
        writeln!(out, "property {} {} {}", name, value.len(), value)?;
    }

    for op in &commit.fileops {
        out.write_all(&op.emit_line())?;
        writeln!(out)?;
        if let Some(data) = op.inline_data() {
            writeln!(out, "data {}", data.len())?;
            out.write_all(data)?;
            writeln!(out)?;
        }
    }
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadOptions;
    use crate::importer::read_stream_bytes;
    use pretty_assertions::assert_eq;

    const SMALL_STREAM: &str = "\
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

    fn emit(repo: &Repository, options: &WriteOptions) -> String {
        let mut out = Vec::new();
        write_stream(repo, None, options, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_round_trip_is_stable() {
        let repo = read(SMALL_STREAM);
        let first = emit(&repo, &WriteOptions::default());
        let reparsed = read(&first);
        let second = emit(&reparsed, &WriteOptions::default());
        assert_eq!(first, second);
    }

    #[test]
    fn test_emission_shape() {
        let repo = read(SMALL_STREAM);
        let text = emit(&repo, &WriteOptions::default());
        assert!(text.starts_with("blob\nmark :1\ndata 6\nhello\n"));
        assert!(text.contains("commit refs/heads/master\nmark :2\n"));
        assert!(text.contains("from :2\nD README\n"));
        // Full history: no incremental reset.
        assert!(!text.contains("^0"));
    }

    #[test]
    fn test_incremental_reset_for_partial_selection() {
        let repo = read(SMALL_STREAM);
        // Select only the tip commit.
        let selection: OrderedIntSet = [2].into_iter().collect();
        let mut out = Vec::new();
        write_stream(&repo, Some(&selection), &WriteOptions::default(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("reset refs/heads/master^0\n"));
        // The out-of-selection parent is dropped without --callout.
        assert!(!text.contains("from :2"));
    }

    #[test]
    fn test_callout_for_out_of_selection_parent() {
        let repo = read(SMALL_STREAM);
        let selection: OrderedIntSet = [2].into_iter().collect();
        let options = WriteOptions {
            callout: true,
            noincremental: true,
            ..Default::default()
        };
        let mut out = Vec::new();
        write_stream(&repo, Some(&selection), &options, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("from 2020-09-13T12:26:40Z!a@x"));
        assert!(!text.contains("^0"));
    }

    #[test]
    fn test_legacy_id_appendix() {
        let mut repo = read(SMALL_STREAM);
        repo.commit_mut_at(1).unwrap().legacy_id = Some("123".to_owned());
        let options = WriteOptions {
            legacy: true,
            ..Default::default()
        };
        let text = emit(&repo, &options);
        assert!(text.contains("\nLegacy-ID: 123\n"));
    }

    #[test]
    fn test_blob_only_stream() {
        let stream = "blob\nmark :1\ndata 3\nxyz\n";
        let repo = read(stream);
        let text = emit(&repo, &WriteOptions::default());
        let reparsed = read(&text);
        assert_eq!(reparsed.events.len(), 1);
        assert_eq!(emit(&reparsed, &WriteOptions::default()), text);
    }
}
