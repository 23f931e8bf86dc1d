// src/aggregation.rs
// Aggregation pipeline implementation

pub mod accumulator;
mod bucket;
pub mod expression;

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use crate::error::{QuarryError, Result};
use crate::find_options::{apply_sort, merge_projected, project_path, projection_flag, SortDirection};
use crate::options::AggregateOptions;
use crate::query::Filter;
use crate::value::{Map, Value};
use crate::value_utils::{canonical_key, remove_path, set_path};
use crate::{log_debug, log_trace};

use accumulator::AccumulatorSet;
pub use bucket::{BucketAutoStage, BucketStage};
use expression::Expr;

fn config_error(message: impl Into<String>) -> QuarryError {
    QuarryError::ConfigError(message.into())
}

/// A document-level failure recorded while a stage kept running
#[derive(Debug)]
pub struct StageFailure {
    /// Position of the stage in the pipeline
    pub stage_index: usize,
    /// Stage operator, `$facet.<facet>.<stage>` for failures inside a facet
    pub stage: String,
    pub error: QuarryError,
}

/// Result of running a pipeline
#[derive(Debug, Default)]
pub struct AggregateOutput {
    pub documents: Vec<Value>,
    pub failures: Vec<StageFailure>,
}

impl AggregateOutput {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Per-stage execution state: failure sink and options
struct StageContext<'a> {
    index: usize,
    name: &'static str,
    options: AggregateOptions,
    failures: &'a mut Vec<StageFailure>,
}

impl StageContext<'_> {
    /// Keep a per-document result, recording document-local errors instead of aborting
    fn keep<T>(&mut self, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_document_local() => {
                log_trace!("{} dropped a document: {}", self.name, err);
                self.failures.push(StageFailure {
                    stage_index: self.index,
                    stage: self.name.to_string(),
                    error: err,
                });
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

/// Aggregation pipeline
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

/// Pipeline stage
#[derive(Debug, Clone)]
pub enum Stage {
    Match(Filter),
    Sort(Vec<(String, SortDirection)>),
    Limit(usize),
    Skip(usize),
    Project(ProjectStage),
    AddFields(Vec<(String, Expr)>),
    Group(GroupStage),
    Unwind(UnwindStage),
    Bucket(BucketStage),
    BucketAuto(BucketAutoStage),
    Facet(Vec<(String, Pipeline)>),
    Count(String),
}

impl Pipeline {
    /// Create pipeline from JSON array
    pub fn from_json(pipeline_json: &JsonValue) -> Result<Self> {
        let stages_array = pipeline_json
            .as_array()
            .ok_or_else(|| config_error("pipeline must be an array"))?;

        let mut stages = Vec::with_capacity(stages_array.len());
        for (index, stage_json) in stages_array.iter().enumerate() {
            let stage = Stage::from_json(stage_json).map_err(|err| match err {
                QuarryError::ConfigError(msg) => {
                    config_error(format!("stage {}: {}", index, msg))
                }
                other => other,
            })?;
            stages.push(stage);
        }

        Ok(Pipeline { stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Execute pipeline on documents with default options
    pub fn execute(&self, docs: Vec<Value>) -> Result<AggregateOutput> {
        self.execute_with_options(docs, AggregateOptions::default())
    }

    pub fn execute_with_options(
        &self,
        mut docs: Vec<Value>,
        options: AggregateOptions,
    ) -> Result<AggregateOutput> {
        let mut failures = Vec::new();
        for (index, stage) in self.stages.iter().enumerate() {
            let before = docs.len();
            let mut ctx = StageContext {
                index,
                name: stage.name(),
                options,
                failures: &mut failures,
            };
            docs = stage.execute(docs, &mut ctx)?;
            log_trace!("stage {} {}: {} -> {} documents", index, stage.name(), before, docs.len());
        }
        Ok(AggregateOutput {
            documents: docs,
            failures,
        })
    }
}

impl Stage {
    /// Parse stage from JSON
    pub fn from_json(stage_json: &JsonValue) -> Result<Self> {
        let obj = stage_json
            .as_object()
            .ok_or_else(|| config_error("stage must be an object"))?;
        if obj.len() != 1 {
            return Err(config_error("each stage must have exactly one operator"));
        }
        let Some((stage_name, spec)) = obj.iter().next() else {
            return Err(config_error("each stage must have exactly one operator"));
        };

        let stage = match stage_name.as_str() {
            "$match" => Stage::Match(
                Filter::from_json(spec).map_err(|e| config_error(format!("$match: {}", e)))?,
            ),
            "$sort" => Stage::Sort(parse_sort(spec)?),
            "$limit" => match spec.as_u64() {
                Some(n) if n > 0 => Stage::Limit(n as usize),
                _ => return Err(config_error("$limit must be a positive integer")),
            },
            "$skip" => match spec.as_u64() {
                Some(n) => Stage::Skip(n as usize),
                None => return Err(config_error("$skip must be a non-negative integer")),
            },
            "$project" => Stage::Project(ProjectStage::from_json(spec)?),
            "$addFields" | "$set" => Stage::AddFields(parse_add_fields(spec)?),
            "$group" => Stage::Group(GroupStage::from_json(spec)?),
            "$unwind" => Stage::Unwind(UnwindStage::from_json(spec)?),
            "$bucket" => Stage::Bucket(BucketStage::from_json(spec)?),
            "$bucketAuto" => Stage::BucketAuto(BucketAutoStage::from_json(spec)?),
            "$facet" => Stage::Facet(parse_facet(spec)?),
            "$count" => Stage::Count(parse_count(spec)?),
            _ => return Err(config_error(format!("unknown pipeline stage '{}'", stage_name))),
        };
        Ok(stage)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Sort(_) => "$sort",
            Stage::Limit(_) => "$limit",
            Stage::Skip(_) => "$skip",
            Stage::Project(_) => "$project",
            Stage::AddFields(_) => "$addFields",
            Stage::Group(_) => "$group",
            Stage::Unwind(_) => "$unwind",
            Stage::Bucket(_) => "$bucket",
            Stage::BucketAuto(_) => "$bucketAuto",
            Stage::Facet(_) => "$facet",
            Stage::Count(_) => "$count",
        }
    }

    /// Execute this stage
    fn execute(&self, docs: Vec<Value>, ctx: &mut StageContext<'_>) -> Result<Vec<Value>> {
        match self {
            Stage::Match(filter) => Ok(docs.into_iter().filter(|doc| filter.matches(doc)).collect()),
            Stage::Sort(keys) => {
                let mut docs = docs;
                apply_sort(&mut docs, keys);
                Ok(docs)
            }
            Stage::Limit(n) => Ok(docs.into_iter().take(*n).collect()),
            Stage::Skip(n) => Ok(docs.into_iter().skip(*n).collect()),
            Stage::Project(stage) => {
                let mut results = Vec::with_capacity(docs.len());
                for doc in &docs {
                    results.extend(ctx.keep(stage.project_document(doc))?);
                }
                Ok(results)
            }
            Stage::AddFields(fields) => {
                let mut results = Vec::with_capacity(docs.len());
                for doc in docs {
                    results.extend(ctx.keep(add_fields(fields, doc))?);
                }
                Ok(results)
            }
            Stage::Group(stage) => stage.execute(docs, ctx),
            Stage::Unwind(stage) => stage.execute(docs, ctx),
            Stage::Bucket(stage) => stage.execute(docs, ctx),
            Stage::BucketAuto(stage) => stage.execute(docs, ctx),
            Stage::Facet(facets) => execute_facet(facets, docs, ctx),
            Stage::Count(field) => {
                if docs.is_empty() {
                    return Ok(Vec::new());
                }
                let mut out = Map::new();
                out.insert(field.clone(), Value::Int(docs.len() as i64));
                Ok(vec![Value::Object(out)])
            }
        }
    }
}

fn parse_sort(spec: &JsonValue) -> Result<Vec<(String, SortDirection)>> {
    let obj = spec
        .as_object()
        .filter(|o| !o.is_empty())
        .ok_or_else(|| config_error("$sort must be a non-empty object"))?;
    obj.iter()
        .map(|(field, dir)| {
            let direction = dir
                .as_f64()
                .filter(|d| d.fract() == 0.0)
                .and_then(|d| SortDirection::from_i64(d as i64))
                .ok_or_else(|| {
                    config_error(format!("$sort direction for '{}' must be 1 or -1", field))
                })?;
            Ok((field.clone(), direction))
        })
        .collect()
}

fn parse_field_exprs(stage: &str, spec: &JsonValue) -> Result<Vec<(String, Expr)>> {
    let obj = spec
        .as_object()
        .filter(|o| !o.is_empty())
        .ok_or_else(|| config_error(format!("{} must be a non-empty object", stage)))?;
    obj.iter()
        .map(|(field, expr)| {
            if field.starts_with('$') || field.split('.').any(str::is_empty) {
                return Err(config_error(format!("{}: invalid field name '{}'", stage, field)));
            }
            Ok((field.clone(), Expr::parse(expr)?))
        })
        .collect()
}

fn parse_add_fields(spec: &JsonValue) -> Result<Vec<(String, Expr)>> {
    parse_field_exprs("$addFields", spec)
}

/// Evaluate every field against the input document, then merge
fn add_fields(fields: &[(String, Expr)], doc: Value) -> Result<Value> {
    let mut computed = Vec::with_capacity(fields.len());
    for (field, expr) in fields {
        computed.push((field, expr.evaluate_optional(&doc)?));
    }
    let Value::Object(mut out) = doc else {
        return Ok(doc);
    };
    for (field, value) in computed {
        if let Some(value) = value {
            set_path(&mut out, field, value)?;
        }
    }
    Ok(Value::Object(out))
}

fn parse_count(spec: &JsonValue) -> Result<String> {
    match spec.as_str() {
        Some(name) if !name.is_empty() && !name.starts_with('$') && !name.contains('.') => {
            Ok(name.to_string())
        }
        _ => Err(config_error(
            "$count requires a non-empty field name without '$' or '.'",
        )),
    }
}

#[derive(Debug, Clone)]
pub enum ProjectField {
    Include,
    Exclude,
    Computed(Expr),
}

/// $project stage - inclusion, exclusion or computed fields
#[derive(Debug, Clone)]
pub struct ProjectStage {
    fields: Vec<(String, ProjectField)>,
    include_id: bool,
    exclusion: bool,
}

impl ProjectStage {
    fn from_json(spec: &JsonValue) -> Result<Self> {
        let obj = spec
            .as_object()
            .filter(|o| !o.is_empty())
            .ok_or_else(|| config_error("$project must be a non-empty object"))?;

        let mut fields = Vec::with_capacity(obj.len());
        let mut include_id = true;
        let mut id_computed = false;
        for (path, value) in obj {
            if path.starts_with('$') || path.split('.').any(str::is_empty) {
                return Err(config_error(format!("$project: invalid field name '{}'", path)));
            }
            let field = match value {
                JsonValue::Bool(_) | JsonValue::Number(_) => match projection_flag(value) {
                    Some(true) => ProjectField::Include,
                    Some(false) => ProjectField::Exclude,
                    None => {
                        return Err(config_error(format!(
                            "$project value for '{}' must be 0, 1, true, false or an expression",
                            path
                        )))
                    }
                },
                expr => ProjectField::Computed(Expr::parse(expr)?),
            };
            if path == "_id" {
                match field {
                    ProjectField::Include => continue,
                    ProjectField::Exclude => {
                        include_id = false;
                        continue;
                    }
                    ProjectField::Computed(_) => id_computed = true,
                }
            }
            fields.push((path.clone(), field));
        }

        let excludes = fields
            .iter()
            .filter(|(_, f)| matches!(f, ProjectField::Exclude))
            .count();
        if excludes > 0 && excludes != fields.len() {
            return Err(config_error(
                "$project cannot mix exclusion with inclusion or computed fields",
            ));
        }
        let exclusion = excludes > 0 || (fields.is_empty() && !include_id);
        if id_computed {
            include_id = false;
            // computed _id goes first, the way a stored _id would
            fields.sort_by_key(|(path, _)| path != "_id");
        }

        Ok(ProjectStage {
            fields,
            include_id,
            exclusion,
        })
    }

    fn project_document(&self, doc: &Value) -> Result<Value> {
        let Value::Object(source) = doc else {
            return Ok(doc.clone());
        };

        if self.exclusion {
            let mut out = source.clone();
            if !self.include_id {
                out.shift_remove("_id");
            }
            for (path, _) in &self.fields {
                remove_path(&mut out, path);
            }
            return Ok(Value::Object(out));
        }

        let mut out = Map::new();
        if self.include_id {
            if let Some(id) = source.get("_id") {
                out.insert("_id".to_string(), id.clone());
            }
        }
        for (path, field) in &self.fields {
            match field {
                ProjectField::Include => {
                    if let Some(value) = project_path(doc, path) {
                        merge_projected(&mut out, path, value);
                    }
                }
                ProjectField::Computed(expr) => {
                    if let Some(value) = expr.evaluate_optional(doc)? {
                        set_path(&mut out, path, value)?;
                    }
                }
                ProjectField::Exclude => {}
            }
        }
        Ok(Value::Object(out))
    }
}

/// $group stage - group documents and compute aggregates
#[derive(Debug, Clone)]
pub struct GroupStage {
    id: Expr,
    accumulators: AccumulatorSet,
}

impl GroupStage {
    fn from_json(spec: &JsonValue) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| config_error("$group must be an object"))?;
        let id = obj
            .get("_id")
            .ok_or_else(|| config_error("$group requires an _id expression"))?;
        Ok(GroupStage {
            id: Expr::parse(id)?,
            accumulators: AccumulatorSet::from_json(obj, &["_id"])?,
        })
    }

    fn execute(&self, docs: Vec<Value>, ctx: &mut StageContext<'_>) -> Result<Vec<Value>> {
        // Groups keep first-seen order
        let mut groups: IndexMap<String, (Value, Vec<accumulator::AccState>)> = IndexMap::new();

        for doc in &docs {
            let evaluated = self
                .id
                .evaluate(doc)
                .and_then(|key| Ok((key, self.accumulators.inputs(doc)?)));
            let Some((key, inputs)) = ctx.keep(evaluated)? else {
                continue;
            };
            let (_, states) = groups
                .entry(canonical_key(&key))
                .or_insert_with(|| (key, self.accumulators.new_states()));
            AccumulatorSet::update(states, inputs);
        }

        log_debug!("$group produced {} groups from {} documents", groups.len(), docs.len());
        Ok(groups
            .into_values()
            .map(|(key, states)| {
                let mut out = Map::new();
                out.insert("_id".to_string(), key);
                self.accumulators.finish_into(states, &mut out);
                Value::Object(out)
            })
            .collect())
    }
}

/// $unwind stage - one output document per array element
#[derive(Debug, Clone)]
pub struct UnwindStage {
    path: String,
    preserve_null_and_empty: bool,
}

impl UnwindStage {
    fn from_json(spec: &JsonValue) -> Result<Self> {
        let (path, preserve) = match spec {
            JsonValue::String(path) => (path.as_str(), false),
            JsonValue::Object(obj) => {
                if let Some(key) = obj
                    .keys()
                    .find(|k| !matches!(k.as_str(), "path" | "preserveNullAndEmptyArrays"))
                {
                    return Err(config_error(format!("$unwind does not accept '{}'", key)));
                }
                let path = obj
                    .get("path")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| config_error("$unwind requires a string path"))?;
                let preserve = match obj.get("preserveNullAndEmptyArrays") {
                    None => false,
                    Some(JsonValue::Bool(b)) => *b,
                    Some(_) => {
                        return Err(config_error(
                            "$unwind preserveNullAndEmptyArrays must be a boolean",
                        ))
                    }
                };
                (path, preserve)
            }
            _ => return Err(config_error("$unwind requires a path string or an object")),
        };

        let field = path
            .strip_prefix('$')
            .filter(|p| !p.is_empty() && !p.split('.').any(str::is_empty))
            .ok_or_else(|| config_error(format!("$unwind path '{}' must be a '$' field path", path)))?;

        Ok(UnwindStage {
            path: field.to_string(),
            preserve_null_and_empty: preserve,
        })
    }

    fn execute(&self, docs: Vec<Value>, ctx: &mut StageContext<'_>) -> Result<Vec<Value>> {
        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            let items = match doc.get_path(&self.path) {
                Some(Value::Array(items)) if !items.is_empty() => items.clone(),
                Some(Value::Array(_)) | Some(Value::Null) | None => {
                    if self.preserve_null_and_empty {
                        results.push(doc);
                    }
                    continue;
                }
                // a scalar behaves like a one-element array
                Some(_) => {
                    results.push(doc);
                    continue;
                }
            };
            for item in items {
                let mut out = doc.clone();
                let written = match out.as_object_mut() {
                    Some(map) => set_path(map, &self.path, item),
                    None => Ok(()),
                };
                results.extend(ctx.keep(written.map(|_| out))?);
            }
        }
        Ok(results)
    }
}

fn parse_facet(spec: &JsonValue) -> Result<Vec<(String, Pipeline)>> {
    let obj = spec
        .as_object()
        .filter(|o| !o.is_empty())
        .ok_or_else(|| config_error("$facet must be a non-empty object"))?;
    let mut facets = Vec::with_capacity(obj.len());
    for (name, sub) in obj {
        if name.is_empty() || name.starts_with('$') || name.contains('.') {
            return Err(config_error(format!("$facet: invalid facet name '{}'", name)));
        }
        let pipeline = Pipeline::from_json(sub)
            .map_err(|e| config_error(format!("$facet '{}': {}", name, e)))?;
        if pipeline.stages.iter().any(|s| matches!(s, Stage::Facet(_))) {
            return Err(config_error(format!(
                "$facet '{}' cannot contain a nested $facet",
                name
            )));
        }
        facets.push((name.clone(), pipeline));
    }
    Ok(facets)
}

/// Run every sub-pipeline over its own copy of the input
///
/// Sub-pipelines run on scoped threads unless `parallel_facets` is off.
fn execute_facet(
    facets: &[(String, Pipeline)],
    docs: Vec<Value>,
    ctx: &mut StageContext<'_>,
) -> Result<Vec<Value>> {
    let options = ctx.options;
    let outputs: Vec<Result<AggregateOutput>> = if options.parallel_facets && facets.len() > 1 {
        let input = &docs;
        let joined = crossbeam::scope(|scope| {
            let handles: Vec<_> = facets
                .iter()
                .map(|(_, pipeline)| {
                    scope.spawn(move |_| pipeline.execute_with_options(input.clone(), options))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|payload| std::panic::resume_unwind(payload))
                })
                .collect::<Vec<_>>()
        });
        joined.unwrap_or_else(|payload| std::panic::resume_unwind(payload))
    } else {
        facets
            .iter()
            .map(|(_, pipeline)| pipeline.execute_with_options(docs.clone(), options))
            .collect()
    };

    let mut out = Map::new();
    for ((name, _), output) in facets.iter().zip(outputs) {
        let output = output?;
        for failure in output.failures {
            ctx.failures.push(StageFailure {
                stage_index: ctx.index,
                stage: format!("$facet.{}.{}", name, failure.stage),
                error: failure.error,
            });
        }
        out.insert(name.clone(), Value::Array(output.documents));
    }
    Ok(vec![Value::Object(out)])
}
