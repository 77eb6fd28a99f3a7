//! Scripted steps, one per command-line argument.
//!
//! ```text
//! add <name>                  rename <id> <name>        delete <id>
//! external-add <name>         external-rename <id> <name>
//! external-delete <id>        fail <unreachable|reject|lost>
//! refresh                     wait                      show
//! ```

use std::fmt;
use std::str::FromStr;

use kaisha_client::Fault;
use kaisha_types::{CompanyId, MutationKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Add(String),
    Rename(CompanyId, String),
    Delete(CompanyId),
    ExternalAdd(String),
    ExternalRename(CompanyId, String),
    ExternalDelete(CompanyId),
    Fail(Fault),
    Refresh,
    Wait,
    Show,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepParseError(String);

impl fmt::Display for StepParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for StepParseError {}

fn err(msg: impl Into<String>) -> StepParseError {
    StepParseError(msg.into())
}

fn parse_id(word: Option<&str>) -> Result<CompanyId, StepParseError> {
    let word = word.ok_or_else(|| err("missing company id"))?;
    word.parse::<i64>()
        .map(CompanyId::new)
        .map_err(|_| err(format!("not a company id: {word:?}")))
}

fn rest(words: &[&str]) -> Result<String, StepParseError> {
    if words.is_empty() {
        return Err(err("missing name"));
    }
    Ok(words.join(" "))
}

fn id_and_name(words: &[&str]) -> Result<(CompanyId, String), StepParseError> {
    let (first, tail) = words.split_first().ok_or_else(|| err("missing company id"))?;
    Ok((parse_id(Some(*first))?, rest(tail)?))
}

/// Local mutation steps: `add <name>`, `rename <id> <name>`, `delete <id>`.
fn mutation_step(kind: MutationKind, args: &[&str]) -> Result<Step, StepParseError> {
    Ok(match kind {
        MutationKind::Add => Step::Add(rest(args)?),
        MutationKind::Rename => {
            let (id, name) = id_and_name(args)?;
            Step::Rename(id, name)
        }
        MutationKind::Delete => Step::Delete(parse_id(args.first().copied())?),
    })
}

impl FromStr for Step {
    type Err = StepParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = s.split_whitespace().collect();
        let Some((&verb, args)) = words.split_first() else {
            return Err(err("empty step"));
        };
        if let Some(kind) = MutationKind::from_str(verb) {
            return mutation_step(kind, args);
        }
        let step = match verb {
            "external-add" => Step::ExternalAdd(rest(args)?),
            "external-rename" => {
                let (id, name) = id_and_name(args)?;
                Step::ExternalRename(id, name)
            }
            "external-delete" => Step::ExternalDelete(parse_id(args.first().copied())?),
            "fail" => Step::Fail(match args.first().copied() {
                Some("unreachable") => Fault::Unreachable,
                Some("reject") => Fault::Reject(
                    if args.len() > 1 { args[1..].join(" ") } else { "rejected by server".to_string() },
                ),
                Some("lost") => Fault::LostResponse,
                other => return Err(err(format!("unknown fault: {other:?}"))),
            }),
            "refresh" => Step::Refresh,
            "wait" => Step::Wait,
            "show" => Step::Show,
            other => return Err(err(format!("unknown step: {other:?}"))),
        };
        Ok(step)
    }
}
