//! Parses the minimal `surql` subset a view's plan needs: scan, selection,
//! equi-join, projection, sort, limit/offset, and one level of nested
//! subqueries. Kept hand-rolled and close to the data it serves rather than
//! reached out to a parser-combinator crate, matching the surrounding
//! codebase's preference for small purpose-built algorithms.

use grimoire_core::errors::PlanError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Literal {
    String(String),
    Number(f64),
    RecordRef(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Gt,
    Lt,
    In,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Predicate {
    Compare {
        field: String,
        op: CompareOp,
        literal: LiteralOrList,
    },
    And(Vec<Predicate>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LiteralOrList {
    One(Literal),
    List(Vec<Literal>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Projection {
    All,
    Fields(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogicalPlan {
    Scan {
        table: String,
    },
    Selection {
        input: Box<LogicalPlan>,
        predicate: Predicate,
    },
    Join {
        input: Box<LogicalPlan>,
        right_table: String,
        left_field: String,
        right_field: String,
    },
    Projection {
        input: Box<LogicalPlan>,
        fields: Projection,
    },
    Sort {
        input: Box<LogicalPlan>,
        field: String,
        descending: bool,
    },
    LimitOffset {
        input: Box<LogicalPlan>,
        limit: Option<usize>,
        offset: usize,
    },
    NestedAttach {
        input: Box<LogicalPlan>,
        field: String,
        nested: Box<LogicalPlan>,
    },
}

impl LogicalPlan {
    /// Every base table the plan reads from, used to decide which ingested
    /// tables can affect this view.
    pub fn input_tables(&self) -> Vec<String> {
        let mut tables = Vec::new();
        self.collect_tables(&mut tables);
        tables
    }

    fn collect_tables(&self, out: &mut Vec<String>) {
        match self {
            LogicalPlan::Scan { table } => {
                if !out.contains(table) {
                    out.push(table.clone());
                }
            }
            LogicalPlan::Selection { input, .. }
            | LogicalPlan::Projection { input, .. }
            | LogicalPlan::Sort { input, .. }
            | LogicalPlan::LimitOffset { input, .. } => input.collect_tables(out),
            LogicalPlan::Join {
                input, right_table, ..
            } => {
                input.collect_tables(out);
                if !out.contains(right_table) {
                    out.push(right_table.clone());
                }
            }
            LogicalPlan::NestedAttach { input, nested, .. } => {
                input.collect_tables(out);
                nested.collect_tables(out);
            }
        }
    }
}

struct Tokenizer;

impl Tokenizer {
    fn tokenize(surql: &str) -> Vec<String> {
        let spaced = surql
            .replace('(', " ( ")
            .replace(')', " ) ")
            .replace(',', " , ")
            .replace('=', " = ");
        spaced.split_whitespace().map(|s| s.to_string()).collect()
    }
}

struct Parser {
    tokens: Vec<String>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(|s| s.as_str())
    }

    fn peek_upper(&self) -> Option<String> {
        self.peek().map(|s| s.to_uppercase())
    }

    fn next(&mut self) -> Option<String> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect_keyword(&mut self, word: &str) -> Result<(), PlanError> {
        match self.next() {
            Some(tok) if tok.eq_ignore_ascii_case(word) => Ok(()),
            Some(tok) => Err(PlanError::Malformed(format!(
                "expected `{word}`, found `{tok}`"
            ))),
            None => Err(PlanError::Malformed(format!(
                "expected `{word}`, found end of input"
            ))),
        }
    }

    fn at_keyword(&self, word: &str) -> bool {
        self.peek()
            .map(|t| t.eq_ignore_ascii_case(word))
            .unwrap_or(false)
    }

    fn parse_literal(&mut self) -> Result<Literal, PlanError> {
        let tok = self
            .next()
            .ok_or_else(|| PlanError::Malformed("expected literal".into()))?;
        let trimmed = tok.trim_matches(|c| c == '\'' || c == '"');
        if trimmed.contains(':') && !trimmed.starts_with(':') {
            return Ok(Literal::RecordRef(trimmed.to_string()));
        }
        if let Ok(n) = trimmed.parse::<f64>() {
            return Ok(Literal::Number(n));
        }
        Ok(Literal::String(trimmed.to_string()))
    }

    fn parse_literal_or_list(&mut self) -> Result<LiteralOrList, PlanError> {
        if self.peek() == Some("(") {
            self.next();
            let mut items = Vec::new();
            loop {
                items.push(self.parse_literal()?);
                match self.peek() {
                    Some(",") => {
                        self.next();
                    }
                    Some(")") => {
                        self.next();
                        break;
                    }
                    _ => return Err(PlanError::Malformed("unterminated literal list".into())),
                }
            }
            Ok(LiteralOrList::List(items))
        } else {
            Ok(LiteralOrList::One(self.parse_literal()?))
        }
    }

    fn parse_comparison(&mut self) -> Result<Predicate, PlanError> {
        let field = self
            .next()
            .ok_or_else(|| PlanError::Malformed("expected field in predicate".into()))?;
        let op_tok = self
            .next()
            .ok_or_else(|| PlanError::Malformed("expected comparison operator".into()))?;
        let op = match op_tok.to_uppercase().as_str() {
            "=" => CompareOp::Eq,
            ">" => CompareOp::Gt,
            "<" => CompareOp::Lt,
            "IN" => CompareOp::In,
            other => {
                return Err(PlanError::UnsupportedOperator(other.to_string()));
            }
        };
        let literal = self.parse_literal_or_list()?;
        Ok(Predicate::Compare { field, op, literal })
    }

    fn parse_predicate(&mut self) -> Result<Predicate, PlanError> {
        let mut terms = vec![self.parse_comparison()?];
        while self.at_keyword("AND") {
            self.next();
            terms.push(self.parse_comparison()?);
        }
        if terms.len() == 1 {
            Ok(terms.pop().unwrap())
        } else {
            Ok(Predicate::And(terms))
        }
    }

    fn parse_projection(&mut self) -> Result<Projection, PlanError> {
        if self.peek() == Some("*") {
            self.next();
            return Ok(Projection::All);
        }
        let mut fields = Vec::new();
        loop {
            let field = self
                .next()
                .ok_or_else(|| PlanError::Malformed("expected projected field".into()))?;
            fields.push(field);
            if self.peek() == Some(",") {
                self.next();
            } else {
                break;
            }
        }
        Ok(Projection::Fields(fields))
    }

    fn parse_select(&mut self) -> Result<LogicalPlan, PlanError> {
        self.expect_keyword("SELECT")?;
        let projection = self.parse_projection()?;
        self.expect_keyword("FROM")?;
        let table = self
            .next()
            .ok_or_else(|| PlanError::Malformed("expected table after FROM".into()))?;

        let mut plan = LogicalPlan::Scan {
            table: table.clone(),
        };

        if self.at_keyword("WHERE") {
            self.next();
            let predicate = self.parse_predicate()?;
            plan = LogicalPlan::Selection {
                input: Box::new(plan),
                predicate,
            };
        }

        while self.at_keyword("JOIN") {
            self.next();
            let right_table = self
                .next()
                .ok_or_else(|| PlanError::Malformed("expected table after JOIN".into()))?;
            self.expect_keyword("ON")?;
            let left_field = self
                .next()
                .ok_or_else(|| PlanError::Malformed("expected left join field".into()))?;
            self.expect_keyword("=")?;
            let right_field = self
                .next()
                .ok_or_else(|| PlanError::Malformed("expected right join field".into()))?;
            plan = LogicalPlan::Join {
                input: Box::new(plan),
                right_table,
                left_field,
                right_field,
            };
        }

        plan = LogicalPlan::Projection {
            input: Box::new(plan),
            fields: projection,
        };

        if self.at_keyword("ORDER") {
            self.next();
            self.expect_keyword("BY")?;
            let field = self
                .next()
                .ok_or_else(|| PlanError::Malformed("expected field after ORDER BY".into()))?;
            let descending = if self.at_keyword("DESC") {
                self.next();
                true
            } else if self.at_keyword("ASC") {
                self.next();
                false
            } else {
                false
            };
            plan = LogicalPlan::Sort {
                input: Box::new(plan),
                field,
                descending,
            };
        }

        if self.at_keyword("LIMIT") {
            self.next();
            let limit_tok = self
                .next()
                .ok_or_else(|| PlanError::Malformed("expected number after LIMIT".into()))?;
            let limit = limit_tok
                .parse::<usize>()
                .map_err(|_| PlanError::Malformed("LIMIT value must be a number".into()))?;
            let mut offset = 0;
            if self.at_keyword("START") {
                self.next();
                let offset_tok = self
                    .next()
                    .ok_or_else(|| PlanError::Malformed("expected number after START".into()))?;
                offset = offset_tok
                    .parse::<usize>()
                    .map_err(|_| PlanError::Malformed("START value must be a number".into()))?;
            }
            plan = LogicalPlan::LimitOffset {
                input: Box::new(plan),
                limit: Some(limit),
                offset,
            };
        }

        while self.peek().is_some() {
            // `<field> <- ( <nested SELECT> )`
            let field = self
                .next()
                .ok_or_else(|| PlanError::Malformed("expected nested field name".into()))?;
            self.expect_keyword("<-")?;
            self.expect_keyword("(")?;
            let nested = self.parse_select()?;
            self.expect_keyword(")")?;
            plan = LogicalPlan::NestedAttach {
                input: Box::new(plan),
                field,
                nested: Box::new(nested),
            };
        }

        Ok(plan)
    }
}

pub fn parse_surql(surql: &str) -> Result<LogicalPlan, PlanError> {
    let tokens = Tokenizer::tokenize(surql);
    if tokens.is_empty() {
        return Err(PlanError::Malformed("empty surql".into()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let plan = parser.parse_select()?;
    if parser.peek().is_some() {
        return Err(PlanError::Malformed(format!(
            "unexpected trailing tokens starting at `{}`",
            parser.peek().unwrap()
        )));
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_scan() {
        let plan = parse_surql("SELECT * FROM thread").unwrap();
        assert_eq!(plan.input_tables(), vec!["thread".to_string()]);
    }

    #[test]
    fn parses_where_order_limit() {
        let plan = parse_surql(
            "SELECT * FROM thread WHERE status = 'open' ORDER BY created_at DESC LIMIT 10 START 5",
        )
        .unwrap();
        match plan {
            LogicalPlan::LimitOffset { limit, offset, .. } => {
                assert_eq!(limit, Some(10));
                assert_eq!(offset, 5);
            }
            other => panic!("expected LimitOffset, got {other:?}"),
        }
    }

    #[test]
    fn parses_equi_join() {
        let plan = parse_surql("SELECT * FROM thread JOIN author ON thread.author = author.id")
            .unwrap();
        let mut tables = plan.input_tables();
        tables.sort();
        assert_eq!(tables, vec!["author".to_string(), "thread".to_string()]);
    }

    #[test]
    fn rejects_unknown_operator() {
        let err = parse_surql("SELECT * FROM thread WHERE status ~ 'open'").unwrap_err();
        assert!(matches!(err, PlanError::UnsupportedOperator(_)));
    }
}
