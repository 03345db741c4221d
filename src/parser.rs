//! Script parser
//!
//! Implements a hand-written parser for the line-oriented operation
//! language that drives the coordinator:
//!
//! - `begin(T1)`, `beginRO(T2)`, `end(T1)`
//! - `R(T1, x4)`, `W(T1, x4, 42)`
//! - `fail(3)`, `recover(3)`
//! - `dump()`, `dump(x4)`, `dump(3)`
//!
//! Lines starting with `/`, `#`, `'` or `"` are comments. Comment and blank
//! lines do not advance the logical clock, so the parser drops them here.

use crate::error::{ReplikvError, Result};
use crate::types::{SiteId, TxnId, VariableId, SITE_COUNT};

/// One operation for the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Begin { txn: TxnId },
    BeginRo { txn: TxnId },
    Read { txn: TxnId, var: VariableId },
    Write { txn: TxnId, var: VariableId, value: i64 },
    End { txn: TxnId },
    Fail { site: SiteId },
    Recover { site: SiteId },
    Dump(DumpTarget),
}

/// What a `dump` should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpTarget {
    All,
    Site(SiteId),
    Variable(VariableId),
}

/// An operation tagged with the script line it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptLine {
    pub number: usize,
    pub op: Operation,
}

const COMMENT_STARTERS: [char; 4] = ['/', '#', '\'', '"'];

/// Parse a whole script. Comment and blank lines are skipped; every parse
/// error names the offending line.
pub fn parse_script(text: &str) -> Result<Vec<ScriptLine>> {
    let mut ops = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let number = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with(&COMMENT_STARTERS[..]) {
            continue;
        }
        let op = parse_line(line, number)?;
        ops.push(ScriptLine { number, op });
    }
    Ok(ops)
}

/// Parse a single `OP(arg, ...)` line.
pub fn parse_line(line: &str, number: usize) -> Result<Operation> {
    let open = line.find('(').ok_or_else(|| {
        ReplikvError::parse_at(number, format_args!("expected '(' in '{}'", line))
    })?;
    let close = line.rfind(')').ok_or_else(|| {
        ReplikvError::parse_at(number, format_args!("expected ')' in '{}'", line))
    })?;
    if close < open {
        return Err(ReplikvError::parse_at(
            number,
            format_args!("mismatched parentheses in '{}'", line),
        ));
    }
    let name = line[..open].trim();
    let inner = line[open + 1..close].trim();
    let args: Vec<&str> = if inner.is_empty() {
        Vec::new()
    } else {
        inner.split(',').map(str::trim).collect()
    };

    match name {
        "begin" => Ok(Operation::Begin {
            txn: parse_txn(one_arg(&args, name, number)?, number)?,
        }),
        "beginRO" => Ok(Operation::BeginRo {
            txn: parse_txn(one_arg(&args, name, number)?, number)?,
        }),
        "end" => Ok(Operation::End {
            txn: parse_txn(one_arg(&args, name, number)?, number)?,
        }),
        "R" => {
            if args.len() != 2 {
                return Err(ReplikvError::arity(number, name, 2));
            }
            Ok(Operation::Read {
                txn: parse_txn(args[0], number)?,
                var: parse_var(args[1], number)?,
            })
        }
        "W" => {
            if args.len() != 3 {
                return Err(ReplikvError::arity(number, name, 3));
            }
            Ok(Operation::Write {
                txn: parse_txn(args[0], number)?,
                var: parse_var(args[1], number)?,
                value: args[2].parse::<i64>().map_err(|_| {
                    ReplikvError::parse_at(
                        number,
                        format_args!("'{}' is not an integer value", args[2]),
                    )
                })?,
            })
        }
        "fail" => Ok(Operation::Fail {
            site: parse_site(one_arg(&args, name, number)?, number)?,
        }),
        "recover" => Ok(Operation::Recover {
            site: parse_site(one_arg(&args, name, number)?, number)?,
        }),
        "dump" => match args.len() {
            0 => Ok(Operation::Dump(DumpTarget::All)),
            1 => {
                if args[0].starts_with('x') {
                    Ok(Operation::Dump(DumpTarget::Variable(parse_var(
                        args[0], number,
                    )?)))
                } else {
                    Ok(Operation::Dump(DumpTarget::Site(parse_site(
                        args[0], number,
                    )?)))
                }
            }
            _ => Err(ReplikvError::parse_at(
                number,
                "operation dump takes at most 1 argument",
            )),
        },
        other => Err(ReplikvError::parse_at(
            number,
            format_args!("unknown operation '{}'", other),
        )),
    }
}

fn one_arg<'a>(args: &[&'a str], name: &str, number: usize) -> Result<&'a str> {
    if args.len() == 1 {
        Ok(args[0])
    } else {
        Err(ReplikvError::arity(number, name, 1))
    }
}

fn parse_txn(arg: &str, number: usize) -> Result<TxnId> {
    arg.strip_prefix('T')
        .and_then(|rest| rest.parse::<TxnId>().ok())
        .ok_or_else(|| {
            ReplikvError::parse_at(
                number,
                format_args!("'{}' is not a transaction name (expected T1, T2, ...)", arg),
            )
        })
}

fn parse_var(arg: &str, number: usize) -> Result<VariableId> {
    arg.parse::<VariableId>()
        .map_err(|e| ReplikvError::parse_at(number, e))
}

fn parse_site(arg: &str, number: usize) -> Result<SiteId> {
    let site = arg.parse::<SiteId>().map_err(|_| {
        ReplikvError::parse_at(number, format_args!("'{}' is not a site number", arg))
    })?;
    if (1..=SITE_COUNT).contains(&site) {
        Ok(site)
    } else {
        Err(ReplikvError::parse_at(
            number,
            format_args!("site {} out of range 1..{}", site, SITE_COUNT),
        ))
    }
}
