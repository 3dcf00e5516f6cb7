//! Rule set compilation.
//!
//! [`compile`] validates a rule set against the schema and the tool
//! registry, resolves precedence, and layers the dependency graph into
//! execution groups. It either returns a complete [`Plan`] or a
//! [`CompilationError`]; nothing executes in between.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use attestor_core::operators::compile_pattern;
use attestor_core::path::{JsonPath, Segment};
use attestor_core::rule::{RuleDef, RuleKind, RuleLevel, RuleSet, Severity};
use attestor_core::schema::{FieldType, Schema};
use attestor_core::types::RuleId;
use attestor_tools::ToolConfig;
use regex::Regex;

use crate::config::RuntimeConfig;
use crate::error::CompilationError;
use crate::plan::{CompiledRule, ExecutionGroup, Fanout, Plan};

/// Compile `rule_set` into an execution plan.
///
/// Precedence is `order` ascending, then severity descending, then `id`.
/// Malformed regex patterns do not fail compilation; rules using them
/// evaluate to INCOMPLETE.
pub fn compile(
    schema: &Schema,
    rule_set: &RuleSet,
    tools: &[ToolConfig],
    runtime: &RuntimeConfig,
) -> Result<Plan, CompilationError> {
    schema
        .validate()
        .map_err(|e| CompilationError::InvalidSchema(e.to_string()))?;

    let mut tool_names = HashSet::with_capacity(tools.len());
    for tool in tools {
        if !tool_names.insert(tool.name.as_str()) {
            return Err(CompilationError::DuplicateTool(tool.name.clone()));
        }
    }

    let mut defs: Vec<RuleDef> = Vec::with_capacity(rule_set.rules.len());
    let mut ids: HashSet<RuleId> = HashSet::with_capacity(rule_set.rules.len());
    for rule in &rule_set.rules {
        if !ids.insert(rule.id.clone()) {
            return Err(CompilationError::DuplicateRule(rule.id.clone()));
        }
        defs.push(rule.clone());
    }
    if runtime.derive_schema_rules {
        for rule in schema_rules(schema)? {
            // Explicit rules with the same id win.
            if ids.insert(rule.id.clone()) {
                defs.push(rule);
            }
        }
    }

    for def in &defs {
        check_references(def, schema, &tool_names, &ids)?;
    }

    // Precedence.
    defs.sort_by(|a, b| {
        (a.order, Reverse(a.severity), &a.id).cmp(&(b.order, Reverse(b.severity), &b.id))
    });

    let mut patterns: HashMap<String, Result<Regex, String>> = HashMap::new();
    let mut deps: BTreeMap<RuleId, BTreeSet<RuleId>> = BTreeMap::new();
    let mut rules: HashMap<RuleId, Arc<CompiledRule>> = HashMap::with_capacity(defs.len());

    for (precedence, def) in defs.into_iter().enumerate() {
        for pattern in kinds(&def).flat_map(|k| k.patterns()) {
            patterns.entry(pattern.to_string()).or_insert_with(|| {
                compile_pattern(pattern).map_err(|e| {
                    tracing::warn!(rule_id = %def.id, pattern, error = %e, "Invalid pattern");
                    e.to_string()
                })
            });
        }

        let edges: BTreeSet<RuleId> = def
            .depends_on
            .iter()
            .cloned()
            .chain(kinds(&def).flat_map(|k| k.outcome_refs()).map(str::to_string))
            .collect();
        deps.insert(def.id.clone(), edges);

        let compiled = CompiledRule {
            effective_severity: effective_severity(&def),
            precedence,
            fanout: Fanout::of(&def),
            def,
        };
        rules.insert(compiled.def.id.clone(), Arc::new(compiled));
    }

    let groups = layer(&deps, &rules)?;

    tracing::info!(
        rule_set_version = %rule_set.version,
        rules = rules.len(),
        groups = groups.len(),
        "Rule set compiled",
    );

    Ok(Plan::new(
        rule_set.version.clone(),
        schema.clone(),
        tools.to_vec(),
        runtime.clone(),
        groups,
        rules,
        patterns,
    ))
}

fn kinds(def: &RuleDef) -> impl Iterator<Item = &RuleKind> {
    std::iter::once(&def.kind).chain(def.fallback.iter())
}

fn effective_severity(def: &RuleDef) -> Severity {
    match &def.kind {
        RuleKind::Semantic(check) if check.advisory => def.severity.min(Severity::Warn),
        _ => def.severity,
    }
}

// ---------------------------------------------------------------------------
// Reference checks
// ---------------------------------------------------------------------------

fn check_references(
    def: &RuleDef,
    schema: &Schema,
    tools: &HashSet<&str>,
    ids: &HashSet<RuleId>,
) -> Result<(), CompilationError> {
    let fanout = Fanout::of(def);
    for kind in kinds(def) {
        for path in kind.record_paths() {
            if !path_known(schema, fanout, &path) {
                return Err(CompilationError::UnknownField {
                    rule: def.id.clone(),
                    field: path,
                });
            }
        }
        for tool in kind.tools() {
            if !tools.contains(tool) {
                return Err(CompilationError::UnknownTool {
                    rule: def.id.clone(),
                    tool: tool.to_string(),
                });
            }
        }
        for dependency in kind.outcome_refs() {
            if !ids.contains(dependency) {
                return Err(CompilationError::UnknownDependency {
                    rule: def.id.clone(),
                    dependency: dependency.to_string(),
                });
            }
        }
    }
    for dependency in &def.depends_on {
        if !ids.contains(dependency) {
            return Err(CompilationError::UnknownDependency {
                rule: def.id.clone(),
                dependency: dependency.clone(),
            });
        }
    }
    Ok(())
}

/// Record-scoped paths must start at a schema field. Batch-scoped paths bind
/// to `{records, count}` and may reach into records through an index or
/// wildcard.
fn path_known(schema: &Schema, fanout: Fanout, raw: &str) -> bool {
    let Ok(path) = JsonPath::parse(raw) else {
        return false;
    };
    match fanout {
        Fanout::PerRecord | Fanout::BatchToRecords => record_path_known(schema, path.segments()),
        Fanout::Batch => batch_path_known(schema, path.segments()),
    }
}

fn record_path_known(schema: &Schema, segments: &[Segment]) -> bool {
    match segments.first() {
        None => true,
        Some(Segment::Key(key)) => schema.field(key).is_some(),
        Some(_) => false,
    }
}

fn batch_path_known(schema: &Schema, segments: &[Segment]) -> bool {
    match segments {
        [] => true,
        [Segment::Key(key)] if key == "count" => true,
        [Segment::Key(key), rest @ ..] if key == "records" => match rest {
            [] => true,
            [Segment::Index(_) | Segment::Wildcard, tail @ ..] => record_path_known(schema, tail),
            _ => false,
        },
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Dependency layering
// ---------------------------------------------------------------------------

/// Kahn layering: each group holds every rule whose dependencies are all in
/// earlier groups, listed in precedence order.
fn layer(
    deps: &BTreeMap<RuleId, BTreeSet<RuleId>>,
    rules: &HashMap<RuleId, Arc<CompiledRule>>,
) -> Result<Vec<ExecutionGroup>, CompilationError> {
    let mut remaining: BTreeMap<&str, usize> = deps
        .iter()
        .map(|(id, edges)| (id.as_str(), edges.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (id, edges) in deps {
        for dep in edges {
            dependents.entry(dep.as_str()).or_default().push(id.as_str());
        }
    }

    let mut groups = Vec::new();
    loop {
        let mut ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, indegree)| **indegree == 0)
            .map(|(id, _)| *id)
            .collect();
        if ready.is_empty() {
            break;
        }
        ready.sort_by_key(|id| rules.get(*id).map_or(usize::MAX, |r| r.precedence));
        for id in &ready {
            remaining.remove(id);
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(indegree) = remaining.get_mut(dependent) {
                    *indegree -= 1;
                }
            }
        }
        groups.push(ExecutionGroup {
            index: groups.len(),
            rules: ready.into_iter().map(str::to_string).collect(),
        });
    }

    if remaining.is_empty() {
        Ok(groups)
    } else {
        let stuck: BTreeSet<&str> = remaining.keys().copied().collect();
        Err(CompilationError::CyclicDependency {
            cycle: find_cycle(deps, &stuck),
        })
    }
}

/// Walk dependencies inside `stuck` until a rule repeats.
fn find_cycle(deps: &BTreeMap<RuleId, BTreeSet<RuleId>>, stuck: &BTreeSet<&str>) -> Vec<RuleId> {
    let Some(&start) = stuck.iter().next() else {
        return Vec::new();
    };
    let mut path: Vec<&str> = vec![start];
    loop {
        let Some(current) = path.last().copied() else {
            return Vec::new();
        };
        let next = deps
            .get(current)
            .and_then(|edges| edges.iter().map(String::as_str).find(|d| stuck.contains(d)));
        let Some(next) = next else {
            return path.into_iter().map(str::to_string).collect();
        };
        if let Some(pos) = path.iter().position(|p| *p == next) {
            let mut cycle: Vec<RuleId> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(next.to_string());
            return cycle;
        }
        path.push(next);
    }
}

// ---------------------------------------------------------------------------
// Schema-derived rules
// ---------------------------------------------------------------------------

/// Rules implied by field constraints, named `schema.<field>.<check>`.
pub fn schema_rules(schema: &Schema) -> Result<Vec<RuleDef>, CompilationError> {
    let mut rules = Vec::new();
    for field in &schema.fields {
        let path = JsonPath::parse(&field.name).map_err(|e| {
            CompilationError::InvalidSchema(format!("field '{}': {e}", field.name))
        })?;
        let id = |check: &str| format!("schema.{}.{check}", field.name);
        let derived = |check: &str, kind: RuleKind| {
            RuleDef::new(id(check), kind).with_level(RuleLevel::Field)
        };

        if field.required {
            rules.push(derived("not_null", RuleKind::NotNull { field: path.clone() }));
        }
        if field.field_type != FieldType::Any {
            rules.push(derived(
                "type",
                RuleKind::TypeCheck {
                    field: path.clone(),
                    expected: field.field_type,
                },
            ));
        }
        if let Some(pattern) = &field.pattern {
            rules.push(derived(
                "pattern",
                RuleKind::Pattern {
                    field: path.clone(),
                    pattern: pattern.clone(),
                },
            ));
        }
        if let Some(range) = field.range {
            rules.push(derived(
                "range",
                RuleKind::Range {
                    field: path.clone(),
                    min: range.min,
                    max: range.max,
                },
            ));
        }
        if field.unique {
            rules.push(
                RuleDef::new(id("unique"), RuleKind::Unique { fields: vec![path.clone()] })
                    .with_level(RuleLevel::Batch),
            );
        }
    }
    Ok(rules)
}
