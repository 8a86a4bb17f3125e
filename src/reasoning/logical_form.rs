//! Logical forms: conjunctions of typed variables and predicates.
//!
//! ```text
//! Person(x) & WORKS_FOR(x, y) & Company(y) & y.city = "Paris"
//! ```
//!
//! Relation atoms must form a single chain over the variables. The chain is
//! walked from the first variable mentioned; the last variable reached is the
//! answer. Quoted values may not contain `&`.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::optimizer::{PlanOp, Predicate, QueryPlan, SelectivityHint};
use crate::types::{Direction, PropertyValue};

/// One conjunct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "atom", rename_all = "snake_case")]
pub enum Atom {
    /// `Type(x)`.
    Typed {
        /// Variable.
        var: String,
        /// Entity type.
        entity_type: String,
    },
    /// `REL(x, y)`.
    Related {
        /// Relation type.
        relation_type: String,
        /// Source variable.
        source: String,
        /// Target variable.
        target: String,
    },
    /// `x.key = value`.
    Attribute {
        /// Variable.
        var: String,
        /// Property key.
        key: String,
        /// Expected value.
        value: PropertyValue,
    },
    /// `x.name ~ "needle"`, case-insensitive substring.
    NameLike {
        /// Variable.
        var: String,
        /// Needle.
        needle: String,
    },
}

impl Atom {
    fn unary_var(&self) -> Option<&str> {
        match self {
            Self::Typed { var, .. } | Self::Attribute { var, .. } | Self::NameLike { var, .. } => Some(var),
            Self::Related { .. } => None,
        }
    }

    fn first_var(&self) -> &str {
        match self {
            Self::Related { source, .. } => source,
            Self::Typed { var, .. } | Self::Attribute { var, .. } | Self::NameLike { var, .. } => var,
        }
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Typed { var, entity_type } => write!(f, "{}({})", entity_type, var),
            Self::Related {
                relation_type,
                source,
                target,
            } => write!(f, "{}({}, {})", relation_type, source, target),
            Self::Attribute { var, key, value } => match value {
                PropertyValue::String(s) => write!(f, "{}.{} = {:?}", var, key, s),
                other => write!(f, "{}.{} = {}", var, key, other),
            },
            Self::NameLike { var, needle } => write!(f, "{}.name ~ {:?}", var, needle),
        }
    }
}

/// A conjunctive query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogicalForm {
    /// Conjuncts in source order.
    pub atoms: Vec<Atom>,
}

fn unary_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\w+)\(\s*(\w+)\s*\)$").expect("static unary pattern"))
}

fn binary_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\w+)\(\s*(\w+)\s*,\s*(\w+)\s*\)$").expect("static binary pattern"))
}

fn attribute_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\w+)\.(\w+)\s*(=|~)\s*(.+)$").expect("static attribute pattern"))
}

fn parse_value(raw: &str) -> Option<PropertyValue> {
    let raw = raw.trim();
    if let Some(inner) = raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Some(PropertyValue::String(inner.to_string()));
    }
    match raw {
        "true" => return Some(PropertyValue::Bool(true)),
        "false" => return Some(PropertyValue::Bool(false)),
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Some(PropertyValue::Int(i));
    }
    raw.parse::<f64>().ok().map(PropertyValue::Float)
}

impl LogicalForm {
    /// Form from atoms.
    pub fn new(atoms: Vec<Atom>) -> Self {
        Self { atoms }
    }

    /// Parse `atom & atom & ...`.
    pub fn parse(input: &str) -> Result<Self> {
        let mut atoms = Vec::new();
        for (i, part) in input.split('&').enumerate() {
            let part = part.trim();
            let path = format!("atoms.{}", i);
            if let Some(c) = binary_re().captures(part) {
                atoms.push(Atom::Related {
                    relation_type: c[1].to_string(),
                    source: c[2].to_string(),
                    target: c[3].to_string(),
                });
            } else if let Some(c) = unary_re().captures(part) {
                atoms.push(Atom::Typed {
                    entity_type: c[1].to_string(),
                    var: c[2].to_string(),
                });
            } else if let Some(c) = attribute_re().captures(part) {
                let value =
                    parse_value(&c[4]).ok_or_else(|| GraphError::validation(&path, format!("bad value `{}`", &c[4])))?;
                if &c[3] == "~" {
                    let PropertyValue::String(needle) = value else {
                        return Err(GraphError::validation(path, "`~` needs a quoted string"));
                    };
                    if &c[2] != "name" {
                        return Err(GraphError::validation(path, "`~` only applies to `name`"));
                    }
                    atoms.push(Atom::NameLike {
                        var: c[1].to_string(),
                        needle,
                    });
                } else {
                    atoms.push(Atom::Attribute {
                        var: c[1].to_string(),
                        key: c[2].to_string(),
                        value,
                    });
                }
            } else {
                return Err(GraphError::validation(path, format!("cannot parse `{}`", part)));
            }
        }
        Ok(Self { atoms })
    }

    /// Variables in the order the chain visits them.
    pub fn chain(&self) -> Result<Vec<String>> {
        let first = self
            .atoms
            .first()
            .ok_or_else(|| GraphError::InvalidPlan("empty logical form".to_string()))?;
        let mut order = vec![first.first_var().to_string()];
        let mut used = vec![false; self.atoms.len()];
        loop {
            let current = order[order.len() - 1].clone();
            let next = self.atoms.iter().enumerate().find_map(|(i, atom)| match atom {
                Atom::Related { source, target, .. } if !used[i] && (source == &current || target == &current) => {
                    Some((i, if source == &current { target } else { source }))
                }
                _ => None,
            });
            let Some((i, other)) = next else { break };
            if order.contains(other) {
                return Err(GraphError::InvalidPlan(format!("variable `{}` closes a cycle", other)));
            }
            used[i] = true;
            order.push(other.clone());
        }

        if let Some(i) = (0..self.atoms.len()).find(|&i| matches!(self.atoms[i], Atom::Related { .. }) && !used[i]) {
            return Err(GraphError::InvalidPlan(format!("`{}` is not on the chain", self.atoms[i])));
        }
        let on_chain: BTreeSet<&str> = order.iter().map(String::as_str).collect();
        if let Some(atom) = self
            .atoms
            .iter()
            .find(|a| a.unary_var().map(|v| !on_chain.contains(v)).unwrap_or(false))
        {
            return Err(GraphError::InvalidPlan(format!("`{}` uses an unbound variable", atom)));
        }
        Ok(order)
    }

    /// Variable whose bindings the form returns.
    pub fn answer(&self) -> Result<String> {
        let chain = self.chain()?;
        Ok(chain[chain.len() - 1].clone())
    }

    /// Compile into a plan: scan the root type, then alternate expansions and
    /// the filters of the variable just reached.
    pub fn compile(&self) -> Result<QueryPlan> {
        let chain = self.chain()?;
        let root = &chain[0];
        let root_type = self
            .atoms
            .iter()
            .find_map(|a| match a {
                Atom::Typed { var, entity_type } if var == root => Some(entity_type.clone()),
                _ => None,
            })
            .ok_or_else(|| GraphError::InvalidPlan(format!("root variable `{}` needs a type", root)))?;

        let mut plan = QueryPlan::from_source(PlanOp::ScanType {
            entity_type: root_type.clone(),
        });
        plan = self.filters_for(plan, root, Some(&root_type));

        for pair in chain.windows(2) {
            let (from, to) = (&pair[0], &pair[1]);
            let (relation_type, direction) = self
                .atoms
                .iter()
                .find_map(|a| match a {
                    Atom::Related {
                        relation_type,
                        source,
                        target,
                    } if source == from && target == to => Some((relation_type.clone(), Direction::Outgoing)),
                    Atom::Related {
                        relation_type,
                        source,
                        target,
                    } if source == to && target == from => Some((relation_type.clone(), Direction::Incoming)),
                    _ => None,
                })
                .ok_or_else(|| GraphError::InvalidPlan(format!("no relation between `{}` and `{}`", from, to)))?;
            plan = plan.then_op(PlanOp::Expand {
                relation_types: vec![relation_type],
                direction,
            });
            plan = self.filters_for(plan, to, None);
        }
        Ok(plan)
    }

    fn filters_for(&self, mut plan: QueryPlan, var: &str, scanned_type: Option<&str>) -> QueryPlan {
        for atom in &self.atoms {
            let (predicate, hint) = match atom {
                Atom::Typed { var: v, entity_type } if v == var && Some(entity_type.as_str()) != scanned_type => (
                    Predicate::EntityType {
                        types: vec![entity_type.clone()],
                    },
                    SelectivityHint::filter(0.5, 1.0),
                ),
                Atom::Attribute { var: v, key, value } if v == var => (
                    Predicate::PropertyEquals {
                        key: key.clone(),
                        value: value.clone(),
                    },
                    SelectivityHint::filter(0.1, 1.0),
                ),
                Atom::NameLike { var: v, needle } if v == var => (
                    Predicate::NameContains { needle: needle.clone() },
                    SelectivityHint::filter(0.05, 1.5),
                ),
                _ => continue,
            };
            plan = plan.filter(predicate, hint);
        }
        plan
    }
}

impl fmt::Display for LogicalForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, atom) in self.atoms.iter().enumerate() {
            if i > 0 {
                write!(f, " & ")?;
            }
            write!(f, "{}", atom)?;
        }
        Ok(())
    }
}
