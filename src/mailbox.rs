use crate::attribution::Attribution;
use crate::error::MailboxError;
use crate::event::Event;
use crate::orderedset::OrderedIntSet;
use crate::repository::Repository;
use anyhow::Result;
use bstr::BString;
use bstr::ByteSlice as _;

const DELIMITER: &str =
    "------------------------------------------------------------------------------";

/// Serializes the metadata of selected commits and tags as editable
/// message blocks: a delimiter line, RFC822-style headers, a blank line,
/// then the comment text.
pub fn message_out(repo: &Repository, selection: &OrderedIntSet) -> String {
    let mut out = String::new();
    for index in selection.iter() {
        match &repo.events[index] {
            Event::Commit(commit) => {
                out.push_str(DELIMITER);
                out.push('\n');
                out.push_str(&format!("Event-Number: {}\n", index + 1));
                if let Some(mark) = &commit.mark {
                    out.push_str(&format!("Event-Mark: {mark}\n"));
                }
                out.push_str(&format!("Branch: {}\n", commit.branch));
                for author in &commit.authors {
                    out.push_str(&format!("Author: {}\n", author.emit()));
                }
                out.push_str(&format!("Committer: {}\n", commit.committer.emit()));
                if let Some(legacy) = &commit.legacy_id {
                    out.push_str(&format!("Legacy-ID: {legacy}\n"));
                }
                out.push('\n');
                out.push_str(&commit.comment.to_str_lossy());
                if !commit.comment.ends_with(b"\n") {
                    out.push('\n');
                }
            }
            Event::Tag(tag) => {
                out.push_str(DELIMITER);
                out.push('\n');
                out.push_str(&format!("Event-Number: {}\n", index + 1));
                out.push_str(&format!("Tag-Name: {}\n", tag.name));
                if let Some(tagger) = &tag.tagger {
                    out.push_str(&format!("Tagger: {}\n", tagger.emit()));
                }
                out.push('\n');
                out.push_str(&tag.comment.to_str_lossy());
                if !tag.comment.ends_with(b"\n") {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
    out
}

#[derive(Debug, Default)]
struct MessageBlock {
    event_number: Option<usize>,
    event_mark: Option<String>,
    tag_name: Option<String>,
    authors: Vec<Attribution>,
    committer: Option<Attribution>,
    tagger: Option<Attribution>,
    comment: BString,
}

/// Parses edited message blocks and applies them to their target events.
/// The whole input validates before anything is written back: if any block
/// fails to parse or to match an event, the repository is untouched and the
/// error is a mailbox error. Returns the number of updated events.
pub fn message_in(repo: &mut Repository, text: &str) -> Result<usize> {
    let blocks = parse_blocks(text)?;
    // Resolve every target before mutating.
    let mut resolved: Vec<(usize, MessageBlock)> = Vec::new();
    for block in blocks {
        let index = match (&block.event_number, &block.event_mark) {
            (Some(number), _) => {
                let index = number
                    .checked_sub(1)
                    .filter(|&i| i < repo.events.len())
                    .ok_or_else(|| MailboxError(format!("event number {number} out of range")))?;
                index
            }
            (None, Some(mark)) => repo
                .find_mark(mark)
                .ok_or_else(|| MailboxError(format!("no event with mark {mark}")))?,
            (None, None) => {
                return Err(MailboxError(
                    "message block has neither Event-Number nor Event-Mark".to_owned(),
                )
                .into());
            }
        };
        match &repo.events[index] {
            Event::Commit(_) | Event::Tag(_) => {}
            other => {
                return Err(MailboxError(format!(
                    "message block targets a {} event",
                    other.kind()
                ))
                .into());
            }
        }
        resolved.push((index, block));
    }
    let count = resolved.len();
    for (index, block) in resolved {
        match &mut repo.events[index] {
            Event::Commit(commit) => {
                if let Some(committer) = block.committer {
                    commit.committer = committer;
                }
                if !block.authors.is_empty() {
                    commit.authors = block.authors;
                }
                commit.comment = block.comment;
            }
            Event::Tag(tag) => {
                if let Some(tagger) = block.tagger {
                    tag.tagger = Some(tagger);
                }
                if let Some(name) = block.tag_name {
                    tag.name = name;
                }
                tag.comment = block.comment;
            }
            _ => unreachable!(),
        }
    }
    Ok(count)
}

fn parse_blocks(text: &str) -> Result<Vec<MessageBlock>> {
    let mut blocks = Vec::new();
    let mut lines = text.lines().peekable();
    // Skip anything before the first delimiter.
    while let Some(line) = lines.peek() {
        if line.trim_end().chars().all(|c| c == '-') && line.len() >= 4 {
            break;
        }
        lines.next();
    }
    while lines.peek().is_some() {
        lines.next(); // The delimiter itself.
        let mut block = MessageBlock::default();
        // Headers until the blank separator.
        loop {
            let Some(line) = lines.next() else {
                return Err(
                    MailboxError("message block ends inside its headers".to_owned()).into(),
                );
            };
            if line.trim().is_empty() {
                break;
            }
            let Some((key, value)) = line.split_once(':') else {
                return Err(MailboxError(format!("malformed header line {line:?}")).into());
            };
            let value = value.trim();
            match key {
                "Event-Number" => {
                    block.event_number = Some(value.parse().map_err(|_| {
                        MailboxError(format!("bad Event-Number {value:?}"))
                    })?);
                }
                "Event-Mark" => block.event_mark = Some(value.to_owned()),
                "Tag-Name" => block.tag_name = Some(value.to_owned()),
                "Branch" | "Legacy-ID" => {}
                "Author" => block.authors.push(parse_attribution_header(value)?),
                "Committer" => block.committer = Some(parse_attribution_header(value)?),
                "Tagger" => block.tagger = Some(parse_attribution_header(value)?),
                other => {
                    return Err(
                        MailboxError(format!("unknown message header {other:?}")).into()
                    );
                }
            }
        }
        // Body until the next delimiter or end of input.
        let mut comment = BString::from("");
        while let Some(line) = lines.peek() {
            if line.trim_end().chars().all(|c| c == '-') && line.len() >= 4 {
                break;
            }
            comment.extend_from_slice(line.as_bytes());
            comment.push(b'\n');
            lines.next();
        }
        block.comment = comment;
        blocks.push(block);
    }
    if blocks.is_empty() {
        return Err(MailboxError("no message blocks in input".to_owned()).into());
    }
    Ok(blocks)
}

fn parse_attribution_header(value: &str) -> Result<Attribution> {
    Attribution::parse(value.as_bytes().as_bstr())
        .map_err(|e| MailboxError(format!("bad attribution {value:?}: {e}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadOptions;
    use crate::importer::read_stream_bytes;
    use pretty_assertions::assert_eq;

    const STREAM: &str = "\
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
";

    fn repo() -> Repository {
        read_stream_bytes(STREAM.as_bytes(), "test", &ReadOptions::default()).unwrap()
    }

    #[test]
    fn test_round_trip_edit() {
        let mut repo = repo();
        let selection: OrderedIntSet = [1].into_iter().collect();
        let text = message_out(&repo, &selection);
        assert!(text.contains("Event-Number: 2"));
        assert!(text.contains("Committer: A <a@x> 1600000000 +0000"));
        // Edit the comment and the committer name.
        let edited = text
            .replace("ci1", "better message")
            .replace("A <a@x>", "Alice <a@x>");
        let updated = message_in(&mut repo, &edited).unwrap();
        assert_eq!(updated, 1);
        let commit = repo.commit_by_mark(":2").unwrap();
        assert_eq!(commit.comment, BString::from("better message\n"));
        assert_eq!(commit.committer.name, "Alice");
    }

    #[test]
    fn test_malformed_block_leaves_repo_untouched() {
        let mut repo = repo();
        let text = format!(
            "{DELIMITER}\nEvent-Number: 2\nCommitter: Alice <a@x> 1600000000 +0000\n\nnew\n{DELIMITER}\nEvent-Number: 99\n\nbad target\n"
        );
        let err = message_in(&mut repo, &text).unwrap_err();
        assert!(err.downcast_ref::<MailboxError>().is_some());
        // The first, valid block was not applied either.
        let commit = repo.commit_by_mark(":2").unwrap();
        assert_eq!(commit.committer.name, "A");
        assert_eq!(commit.comment, BString::from("ci1"));
    }

    #[test]
    fn test_unknown_header_rejected() {
        let mut repo = repo();
        let text = format!("{DELIMITER}\nEvent-Number: 2\nX-Wat: yes\n\nbody\n");
        let err = message_in(&mut repo, &text).unwrap_err();
        assert!(crate::error::is_recoverable(&err));
    }

    #[test]
    fn test_mark_addressing() {
        let mut repo = repo();
        let text = format!("{DELIMITER}\nEvent-Mark: :2\n\nvia mark\n");
        message_in(&mut repo, &text).unwrap();
        assert_eq!(
            repo.commit_by_mark(":2").unwrap().comment,
            BString::from("via mark\n")
        );
    }
}
