use crate::date::Date;
use anyhow::Result;
use anyhow::bail;
use bstr::BStr;
use bstr::ByteSlice as _;

/// A `(name, email, date)` triple marking authorship, committership or
/// tagging responsibility. The wire syntax is
/// `<name> <email-in-angle-brackets> <date>` where the date is either git
/// raw form or RFC3339.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribution {
    pub name: String,
    pub email: String,
    pub date: Date,
}

impl Attribution {
    pub fn new(name: impl Into<String>, email: impl Into<String>, date: Date) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            date,
        }
    }

    /// Parses an attribution line body (after the `author `/`committer `/
    /// `tagger ` keyword has been stripped).
    pub fn parse(line: &BStr) -> Result<Self> {
        let line = line.trim();
        let Some(lt) = line.find_byte(b'<') else {
            bail!("attribution {:?} lacks an email address", line.as_bstr());
        };
        let Some(gt_rel) = line[lt..].find_byte(b'>') else {
            bail!("attribution {:?} has an unterminated email", line.as_bstr());
        };
        let gt = lt + gt_rel;
        let name = line[..lt].trim().to_str()?.to_owned();
        let email = line[lt + 1..gt].trim().to_str()?.to_owned();
        if email.contains('<') {
            bail!("attribution {:?} has a malformed email", line.as_bstr());
        }
        let date_part = line[gt + 1..].trim();
        let date = Date::parse(date_part.to_str()?)?;
        Ok(Self { name, email, date })
    }

    /// The wire form of this attribution with the raw date format.
    pub fn emit(&self) -> String {
        format!("{} <{}> {}", self.name, self.email, self.date.raw())
    }

    /// The action-stamp form `<ISO8601-UTC>!<email>`.
    pub fn action_stamp(&self) -> String {
        crate::date::action_stamp(&self.date, &self.email)
    }
}

impl std::fmt::Display for Attribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.emit())
    }
}
