mod config;
mod logger;
mod sources;

use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use biograph::{
    BatchId, BiographyId, CandidateId, EntityType, LabelId, NewBiography, NewLabel, Period,
    SourceKind, TaxonomyPath,
};
use biograph_catalog::Catalog;
use chrono::NaiveDate;
use serde_json::{json, Value as JsonValue};
use tokio::runtime::Runtime;

use crate::config::ServerConfig;
use crate::sources::DatasetFileSource;

const MAX_MESSAGE_BYTES: usize = 1_048_576; // 1 MiB
const MAX_PROMPT_BYTES: usize = 8 * 1024; // 8 KiB
const MAX_NAME_BYTES: usize = 512;
const MAX_PATH_BYTES: usize = 1024;
const MAX_ID_BYTES: usize = 128;
const MAX_SELECTED_CANDIDATES: usize = 256;
const MAX_RANK_LIMIT: usize = 200;

struct AppState {
    catalog: Catalog,
    runtime: Runtime,
}

impl AppState {
    fn open(config: &ServerConfig) -> Result<Self> {
        let mut catalog = Catalog::open_with_config(&config.db_path, config.engine.clone())
            .with_context(|| format!("failed to open biograph database at {}", config.db_path))?;
        for source in &config.sources {
            catalog.add_source(Arc::new(DatasetFileSource::new(source)));
        }
        Self::with_catalog(catalog)
    }

    fn with_catalog(catalog: Catalog) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;
        Ok(Self { catalog, runtime })
    }
}

fn main() -> Result<()> {
    let config = config::load().context("failed to load configuration")?;
    logger::init(&config.log_level, true)?;
    let state = AppState::open(&config)?;
    tracing::info!(
        db_path = %config.db_path,
        sources = config.sources.len(),
        "biograph-mcp ready"
    );

    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    loop {
        let maybe = match read_message(&mut reader) {
            Ok(m) => m,
            Err(e) => {
                // Bad framing answers -32700 and the loop keeps reading.
                tracing::warn!(error = %e, "unreadable message");
                let err_resp = json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": -32700, "message": format!("Parse error: {e}") }
                });
                write_message(&mut writer, &err_resp)?;
                continue;
            }
        };
        let Some(request) = maybe else {
            break;
        };
        if let Some(response) = handle_request(&state, &request) {
            write_message(&mut writer, &response)?;
        }
    }

    tracing::info!("stdin closed, shutting down");
    Ok(())
}

fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<JsonValue>> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }

        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(
                    value
                        .trim()
                        .parse::<usize>()
                        .context("invalid Content-Length")?,
                );
            }
        }
    }

    let len = content_length.context("missing Content-Length header")?;
    if len > MAX_MESSAGE_BYTES {
        anyhow::bail!(
            "Content-Length {} exceeds max allowed {} bytes",
            len,
            MAX_MESSAGE_BYTES
        );
    }
    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    let value: JsonValue = serde_json::from_slice(&payload).context("invalid JSON payload")?;
    Ok(Some(value))
}

fn write_message<W: Write>(writer: &mut W, value: &JsonValue) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

fn handle_request(state: &AppState, req: &JsonValue) -> Option<JsonValue> {
    let id = req.get("id").cloned();
    let method = req.get("method").and_then(JsonValue::as_str)?;

    match method {
        "initialize" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "biograph-mcp", "version": env!("CARGO_PKG_VERSION") }
                }
            })
        }),
        "notifications/initialized" => None,
        "tools/list" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": {
                    "tools": tools_schema()
                }
            })
        }),
        "tools/call" => id.map(|id_val| {
            let result = call_tool(state, req.get("params"));
            match result {
                Ok(tool_result) => json!({
                    "jsonrpc": "2.0",
                    "id": id_val,
                    "result": tool_result
                }),
                Err(err) => {
                    tracing::debug!(error = %format!("{err:#}"), "tool call failed");
                    json!({
                        "jsonrpc": "2.0",
                        "id": id_val,
                        "result": {
                            "content": [{ "type": "text", "text": format!("tool error: {err:#}") }],
                            "isError": true
                        }
                    })
                }
            }
        }),
        "ping" => id.map(|id_val| json!({ "jsonrpc": "2.0", "id": id_val, "result": {} })),
        _ => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "error": {
                    "code": -32601,
                    "message": format!("method not found: {method}")
                }
            })
        }),
    }
}

fn tools_schema() -> Vec<JsonValue> {
    let provenance = json!({"type": "string", "enum": ["manual", "external-dataset", "ingest-suggested"]});
    let confidence = json!({"type": "number", "minimum": 0.0, "maximum": 1.0});
    vec![
        json!({
            "name": "search_labels",
            "description": "Find live labels of an entity type whose name matches a prefix (exact, then prefix, then substring matches).",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "entity_type": {"type": "string"},
                    "prefix": {"type": "string"}
                },
                "required": ["entity_type"]
            }
        }),
        json!({
            "name": "list_labels",
            "description": "List live labels of an entity type under a taxonomy path such as \"occupation/medical\".",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "entity_type": {"type": "string"},
                    "path": {"type": "string"}
                },
                "required": ["entity_type"]
            }
        }),
        json!({
            "name": "create_label",
            "description": "Create a label. Names are unique per entity type and path, ignoring case.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "entity_type": {"type": "string"},
                    "path": {"type": "string"},
                    "name": {"type": "string"},
                    "metadata": {"type": "object", "additionalProperties": {"type": "string"}},
                    "provenance": provenance,
                    "confidence": confidence
                },
                "required": ["entity_type", "path", "name"]
            }
        }),
        json!({
            "name": "create_biography",
            "description": "Create an empty biography for a person, building, organisation or event.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "entity_type": {"type": "string"},
                    "name": {"type": "string"}
                },
                "required": ["entity_type", "name"]
            }
        }),
        json!({
            "name": "search_biographies",
            "description": "Find live biographies by name (exact, then prefix, then substring matches), optionally of one entity type.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "entity_type": {"type": "string"}
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": "add_phase",
            "description": "Append a life phase, bounded by ISO dates or tagged with a stage such as \"teens\".",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "biography_id": {"type": "string"},
                    "start": {"type": "string", "format": "date"},
                    "end": {"type": "string", "format": "date"},
                    "stage": {"type": "string"},
                    "narrative": {"type": "string"}
                },
                "required": ["biography_id"]
            }
        }),
        json!({
            "name": "assign_label",
            "description": "Assign a label to a life phase of a biography. Re-assigning updates the confidence.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "biography_id": {"type": "string"},
                    "phase": {"type": "integer", "minimum": 0},
                    "label_id": {"type": "string"},
                    "confidence": confidence
                },
                "required": ["biography_id", "label_id", "confidence"]
            }
        }),
        json!({
            "name": "compare_biographies",
            "description": "Score how alike two biographies are, with a per-feature rationale.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "a": {"type": "string"},
                    "b": {"type": "string"}
                },
                "required": ["a", "b"]
            }
        }),
        json!({
            "name": "rank_most_like",
            "description": "Rank biographies of the same entity type by similarity to a target.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "biography_id": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1, "maximum": MAX_RANK_LIMIT}
                },
                "required": ["biography_id"]
            }
        }),
        json!({
            "name": "submit_ingest_prompt",
            "description": "Interpret a free-text description and propose candidate labels for review. Nothing is stored until accepted.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "prompt": {"type": "string"},
                    "entity_type": {"type": "string"}
                },
                "required": ["prompt"]
            }
        }),
        json!({
            "name": "accept_candidates",
            "description": "Store the selected candidates of an ingest batch as labels and reject the rest.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "batch_id": {"type": "string"},
                    "candidate_ids": {"type": "array", "items": {"type": "string"}, "maxItems": MAX_SELECTED_CANDIDATES}
                },
                "required": ["batch_id", "candidate_ids"]
            }
        }),
        json!({
            "name": "reject_candidates",
            "description": "Reject every pending candidate of an ingest batch.",
            "inputSchema": {
                "type": "object",
                "properties": { "batch_id": {"type": "string"} },
                "required": ["batch_id"]
            }
        }),
        json!({
            "name": "create_link",
            "description": "Link two biographies with a named relationship such as \"works_at\".",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "source_id": {"type": "string"},
                    "target_id": {"type": "string"},
                    "kind": {"type": "string"},
                    "confidence": confidence,
                    "bidirectional": {"type": "boolean"}
                },
                "required": ["source_id", "target_id", "kind", "confidence"]
            }
        }),
        json!({
            "name": "remove_link",
            "description": "Remove a relationship link. Reports whether one existed.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "source_id": {"type": "string"},
                    "target_id": {"type": "string"},
                    "kind": {"type": "string"}
                },
                "required": ["source_id", "target_id", "kind"]
            }
        }),
    ]
}

fn str_arg<'a>(args: &'a JsonValue, key: &str, max_bytes: usize) -> Result<&'a str> {
    let value = args
        .get(key)
        .and_then(JsonValue::as_str)
        .with_context(|| format!("{key} is required"))?;
    check_len(key, value, max_bytes)?;
    Ok(value)
}

fn opt_str_arg<'a>(args: &'a JsonValue, key: &str, max_bytes: usize) -> Result<Option<&'a str>> {
    match args.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(v) => {
            let value = v
                .as_str()
                .with_context(|| format!("{key} must be a string"))?;
            check_len(key, value, max_bytes)?;
            Ok(Some(value))
        }
    }
}

fn check_len(key: &str, value: &str, max_bytes: usize) -> Result<()> {
    if value.len() > max_bytes {
        anyhow::bail!("{key} exceeds max allowed size ({max_bytes} bytes)");
    }
    Ok(())
}

fn f64_arg(args: &JsonValue, key: &str) -> Result<f64> {
    args.get(key)
        .and_then(JsonValue::as_f64)
        .with_context(|| format!("{key} is required and must be a number"))
}

fn usize_arg(args: &JsonValue, key: &str, default: usize) -> Result<usize> {
    match args.get(key) {
        None | Some(JsonValue::Null) => Ok(default),
        Some(v) => {
            let raw = v
                .as_u64()
                .with_context(|| format!("{key} must be a non-negative integer"))?;
            usize::try_from(raw).with_context(|| format!("{key} is out of range: {raw}"))
        }
    }
}

fn date_arg(args: &JsonValue, key: &str) -> Result<Option<NaiveDate>> {
    opt_str_arg(args, key, MAX_NAME_BYTES)?
        .map(|s| {
            s.parse::<NaiveDate>()
                .with_context(|| format!("{key} must be an ISO date (YYYY-MM-DD)"))
        })
        .transpose()
}

fn entity_arg(args: &JsonValue, key: &str) -> Result<EntityType> {
    Ok(EntityType::from(str_arg(args, key, MAX_NAME_BYTES)?))
}

fn text_result(text: String, structured: JsonValue) -> JsonValue {
    json!({
        "content": [{ "type": "text", "text": text }],
        "structuredContent": structured
    })
}

fn call_tool(state: &AppState, params: Option<&JsonValue>) -> Result<JsonValue> {
    let name = params
        .and_then(|v| v.get("name"))
        .and_then(JsonValue::as_str)
        .context("missing tool name")?;
    let args = params
        .and_then(|v| v.get("arguments"))
        .cloned()
        .unwrap_or_else(|| json!({}));
    let catalog = &state.catalog;

    match name {
        "search_labels" => {
            let entity_type = entity_arg(&args, "entity_type")?;
            let prefix = opt_str_arg(&args, "prefix", MAX_NAME_BYTES)?.unwrap_or("");
            let labels = catalog.search_labels(&entity_type, prefix)?;
            Ok(text_result(
                format!("found {} label(s)", labels.len()),
                json!({ "labels": labels }),
            ))
        }
        "list_labels" => {
            let entity_type = entity_arg(&args, "entity_type")?;
            let path = opt_str_arg(&args, "path", MAX_PATH_BYTES)?
                .map(TaxonomyPath::parse)
                .unwrap_or_default();
            let labels = catalog.list_labels(&entity_type, &path)?;
            Ok(text_result(
                format!("{} label(s) under {path}", labels.len()),
                json!({ "labels": labels }),
            ))
        }
        "create_label" => {
            let entity_type = entity_arg(&args, "entity_type")?;
            let path = TaxonomyPath::parse(str_arg(&args, "path", MAX_PATH_BYTES)?);
            let label_name = str_arg(&args, "name", MAX_NAME_BYTES)?;
            let mut new = NewLabel::new(entity_type, path, label_name);
            if let Some(metadata) = args.get("metadata") {
                new.metadata = serde_json::from_value::<BTreeMap<String, String>>(metadata.clone())
                    .context("metadata must map strings to strings")?;
            }
            if let Some(provenance) = opt_str_arg(&args, "provenance", MAX_NAME_BYTES)? {
                new.provenance = serde_json::from_value::<SourceKind>(json!(provenance))
                    .with_context(|| format!("unknown provenance {provenance:?}"))?;
            }
            if args.get("confidence").is_some() {
                new.confidence = f64_arg(&args, "confidence")?;
            }
            let label = catalog.create_label(new)?;
            Ok(text_result(
                format!("created label {} ({})", label.name, label.id),
                json!({ "label": label }),
            ))
        }
        "create_biography" => {
            let entity_type = entity_arg(&args, "entity_type")?;
            let bio_name = str_arg(&args, "name", MAX_NAME_BYTES)?;
            let bio = catalog.create_biography(NewBiography::new(entity_type, bio_name))?;
            Ok(text_result(
                format!("created biography {} ({})", bio.name, bio.id),
                json!({ "biography": bio }),
            ))
        }
        "search_biographies" => {
            let query = str_arg(&args, "query", MAX_NAME_BYTES)?;
            let entity_type = opt_str_arg(&args, "entity_type", MAX_NAME_BYTES)?.map(EntityType::from);
            let found = catalog.search_biographies(entity_type.as_ref(), query)?;
            Ok(text_result(
                format!("found {} biograph(ies)", found.len()),
                json!({ "biographies": found }),
            ))
        }
        "add_phase" => {
            let id = BiographyId::from(str_arg(&args, "biography_id", MAX_ID_BYTES)?);
            let period = Period {
                start: date_arg(&args, "start")?,
                end: date_arg(&args, "end")?,
                stage: opt_str_arg(&args, "stage", MAX_NAME_BYTES)?.map(str::to_string),
            };
            let narrative = opt_str_arg(&args, "narrative", MAX_PROMPT_BYTES)?.unwrap_or("");
            let bio = catalog
                .graph()
                .biographies()
                .add_phase(&id, period, narrative)?;
            Ok(text_result(
                format!("{} now has {} phase(s)", bio.name, bio.phases.len()),
                json!({ "biography": bio, "phase": bio.phases.len() - 1 }),
            ))
        }
        "assign_label" => {
            let id = BiographyId::from(str_arg(&args, "biography_id", MAX_ID_BYTES)?);
            let label_id = LabelId::from(str_arg(&args, "label_id", MAX_ID_BYTES)?);
            let phase = usize_arg(&args, "phase", 0)?;
            let confidence = f64_arg(&args, "confidence")?;
            let bio = catalog.assign_label(&id, phase, &label_id, confidence)?;
            Ok(text_result(
                format!("assigned {label_id} to phase {phase} of {}", bio.name),
                json!({ "biography": bio }),
            ))
        }
        "compare_biographies" => {
            let a = BiographyId::from(str_arg(&args, "a", MAX_ID_BYTES)?);
            let b = BiographyId::from(str_arg(&args, "b", MAX_ID_BYTES)?);
            let result = catalog.compare_biographies(&a, &b)?;
            Ok(text_result(
                format!("similarity {:.3}", result.score),
                json!({ "result": result }),
            ))
        }
        "rank_most_like" => {
            let id = BiographyId::from(str_arg(&args, "biography_id", MAX_ID_BYTES)?);
            let limit = usize_arg(&args, "limit", 10)?;
            if limit > MAX_RANK_LIMIT {
                anyhow::bail!("limit exceeds max allowed value ({MAX_RANK_LIMIT})");
            }
            let ranked = catalog.rank_most_like(&id, limit)?;
            Ok(text_result(
                format!("ranked {} biograph(ies)", ranked.len()),
                json!({ "results": ranked }),
            ))
        }
        "submit_ingest_prompt" => {
            let prompt = str_arg(&args, "prompt", MAX_PROMPT_BYTES)?;
            let hint = opt_str_arg(&args, "entity_type", MAX_NAME_BYTES)?.map(EntityType::from);
            let batch = state
                .runtime
                .block_on(catalog.submit_ingest_prompt(prompt, hint))?;
            Ok(text_result(
                format!(
                    "batch {} proposed {} candidate(s)",
                    batch.id,
                    batch.candidates.len()
                ),
                json!({ "batch": batch }),
            ))
        }
        "accept_candidates" => {
            let batch_id = BatchId::from(str_arg(&args, "batch_id", MAX_ID_BYTES)?);
            let raw_ids = args
                .get("candidate_ids")
                .and_then(JsonValue::as_array)
                .context("candidate_ids is required")?;
            if raw_ids.len() > MAX_SELECTED_CANDIDATES {
                anyhow::bail!(
                    "candidate_ids exceeds max allowed length ({MAX_SELECTED_CANDIDATES})"
                );
            }
            let selected = raw_ids
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(CandidateId::from)
                        .context("candidate_ids must be strings")
                })
                .collect::<Result<Vec<_>>>()?;
            let labels = catalog.accept_candidates(&batch_id, &selected)?;
            Ok(text_result(
                format!("accepted {} label(s)", labels.len()),
                json!({ "labels": labels }),
            ))
        }
        "reject_candidates" => {
            let batch_id = BatchId::from(str_arg(&args, "batch_id", MAX_ID_BYTES)?);
            let rejected = catalog.reject_candidates(&batch_id)?;
            Ok(text_result(
                format!("rejected {rejected} candidate(s)"),
                json!({ "rejected": rejected }),
            ))
        }
        "create_link" => {
            let source = BiographyId::from(str_arg(&args, "source_id", MAX_ID_BYTES)?);
            let target = BiographyId::from(str_arg(&args, "target_id", MAX_ID_BYTES)?);
            let kind = str_arg(&args, "kind", MAX_NAME_BYTES)?;
            let confidence = f64_arg(&args, "confidence")?;
            let bidirectional = args
                .get("bidirectional")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false);
            let link = catalog.create_link(&source, &target, kind, confidence, bidirectional)?;
            Ok(text_result(
                format!("linked {source} -{kind}-> {target}"),
                json!({ "link": link }),
            ))
        }
        "remove_link" => {
            let source = BiographyId::from(str_arg(&args, "source_id", MAX_ID_BYTES)?);
            let target = BiographyId::from(str_arg(&args, "target_id", MAX_ID_BYTES)?);
            let kind = str_arg(&args, "kind", MAX_NAME_BYTES)?;
            let removed = catalog.remove_link(&source, &target, kind)?;
            Ok(text_result(
                if removed {
                    format!("removed {kind} link")
                } else {
                    format!("no {kind} link between {source} and {target}")
                },
                json!({ "removed": removed }),
            ))
        }
        _ => anyhow::bail!("unknown tool: {name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn temp_state() -> AppState {
        AppState::with_catalog(Catalog::open_in_memory().unwrap()).unwrap()
    }

    fn call(state: &AppState, name: &str, arguments: JsonValue) -> Result<JsonValue> {
        call_tool(state, Some(&json!({ "name": name, "arguments": arguments })))
    }

    fn structured<'a>(out: &'a JsonValue, path: &[&str]) -> &'a JsonValue {
        path.iter()
            .fold(&out["structuredContent"], |value, key| &value[*key])
    }

    fn create_person(state: &AppState, name: &str) -> String {
        let out = call(state, "create_biography", json!({ "entity_type": "person", "name": name }))
            .unwrap();
        let id = structured(&out, &["biography", "id"]).as_str().unwrap().to_string();
        call(state, "add_phase", json!({ "biography_id": id, "stage": "career" })).unwrap();
        id
    }

    #[test]
    fn create_assign_and_compare() {
        let state = temp_state();
        let nurse = call(
            &state,
            "create_label",
            json!({ "entity_type": "person", "path": "occupation/medical", "name": "Nurse" }),
        )
        .unwrap();
        let nurse_id = structured(&nurse, &["label", "id"]).as_str().unwrap().to_string();

        let florence = create_person(&state, "Florence Nightingale");
        let mary = create_person(&state, "Mary Seacole");
        for (bio, confidence) in [(&florence, 0.9), (&mary, 0.95)] {
            call(
                &state,
                "assign_label",
                json!({ "biography_id": bio, "label_id": nurse_id, "confidence": confidence }),
            )
            .unwrap();
        }

        let compared = call(&state, "compare_biographies", json!({ "a": florence, "b": mary }))
            .unwrap();
        let score = structured(&compared, &["result", "score"]).as_f64().unwrap();
        assert!(score > 0.9, "shared label should dominate, got {score}");

        let ranked = call(&state, "rank_most_like", json!({ "biography_id": florence })).unwrap();
        let results = structured(&ranked, &["results"]).as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["b"], json!(mary));

        let listed = call(
            &state,
            "list_labels",
            json!({ "entity_type": "person", "path": "occupation" }),
        )
        .unwrap();
        assert_eq!(structured(&listed, &["labels"]).as_array().unwrap().len(), 1);
    }

    #[test]
    fn biographies_are_found_by_name() {
        let state = temp_state();
        let florence = create_person(&state, "Florence Nightingale");
        create_person(&state, "Mary Seacole");
        call(
            &state,
            "create_biography",
            json!({ "entity_type": "building", "name": "Nightingale Wing" }),
        )
        .unwrap();

        let people = call(
            &state,
            "search_biographies",
            json!({ "query": "nightingale", "entity_type": "person" }),
        )
        .unwrap();
        let found = structured(&people, &["biographies"]).as_array().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["id"], json!(florence));

        let any = call(&state, "search_biographies", json!({ "query": "Nightingale" })).unwrap();
        let names: Vec<&str> = structured(&any, &["biographies"])
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, ["Nightingale Wing", "Florence Nightingale"]);
        assert!(call(&state, "search_biographies", json!({})).is_err());
    }

    #[test]
    fn integer_arguments_must_be_non_negative_integers() {
        let state = temp_state();
        let florence = create_person(&state, "Florence Nightingale");
        for phase in [json!(-1), json!(1.5), json!("0")] {
            let err = call(
                &state,
                "assign_label",
                json!({ "biography_id": florence, "label_id": "nurse", "phase": phase, "confidence": 0.9 }),
            )
            .unwrap_err();
            assert!(
                err.to_string().contains("phase must be a non-negative integer"),
                "got {err}"
            );
        }
        let err = call(&state, "rank_most_like", json!({ "biography_id": florence, "limit": -5 }))
            .unwrap_err();
        assert!(err.to_string().contains("limit must be a non-negative integer"), "got {err}");
    }

    #[test]
    fn duplicate_label_is_a_tool_error() {
        let state = temp_state();
        let args = json!({ "entity_type": "person", "path": "occupation", "name": "Nurse" });
        call(&state, "create_label", args.clone()).unwrap();
        let err = call(
            &state,
            "create_label",
            json!({ "entity_type": "person", "path": "occupation", "name": "NURSE" }),
        )
        .expect_err("case-insensitive duplicate must fail");
        assert!(err.to_string().contains("duplicate label"), "got {err}");

        let response = handle_request(
            &state,
            &json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "tools/call",
                "params": { "name": "create_label", "arguments": args }
            }),
        )
        .unwrap();
        assert_eq!(response["result"]["isError"], true);
    }

    #[test]
    fn ingest_round_trip_through_tools() {
        let state = temp_state();
        call(
            &state,
            "create_label",
            json!({ "entity_type": "person", "path": "occupation/medical", "name": "Nurse" }),
        )
        .unwrap();

        let proposed = call(
            &state,
            "submit_ingest_prompt",
            json!({ "prompt": "a nurse in the war", "entity_type": "person" }),
        )
        .unwrap();
        let batch = structured(&proposed, &["batch"]);
        let batch_id = batch["id"].as_str().unwrap();
        let candidates = batch["candidates"].as_array().unwrap();
        assert_eq!(candidates.len(), 1);

        let accepted = call(
            &state,
            "accept_candidates",
            json!({ "batch_id": batch_id, "candidate_ids": [candidates[0]["id"]] }),
        )
        .unwrap();
        assert_eq!(structured(&accepted, &["labels"]).as_array().unwrap().len(), 1);

        let rejected = call(&state, "reject_candidates", json!({ "batch_id": batch_id })).unwrap();
        assert_eq!(*structured(&rejected, &["rejected"]), 0);
    }

    #[test]
    fn links_can_be_created_and_removed() {
        let state = temp_state();
        let florence = create_person(&state, "Florence Nightingale");
        let hospital = call(
            &state,
            "create_biography",
            json!({ "entity_type": "building", "name": "Scutari Barracks" }),
        )
        .unwrap();
        let hospital_id = structured(&hospital, &["biography", "id"]).as_str().unwrap().to_string();

        let link_args = json!({
            "source_id": florence,
            "target_id": hospital_id,
            "kind": "works_at",
            "confidence": 0.9
        });
        let linked = call(&state, "create_link", link_args.clone()).unwrap();
        assert_eq!(*structured(&linked, &["link", "kind"]), "works_at");

        let removed = call(&state, "remove_link", link_args.clone()).unwrap();
        assert_eq!(*structured(&removed, &["removed"]), true);
        let again = call(&state, "remove_link", link_args).unwrap();
        assert_eq!(*structured(&again, &["removed"]), false);
    }

    #[test]
    fn read_message_rejects_oversized_frame() {
        let raw = format!("Content-Length: {}\r\n\r\n", MAX_MESSAGE_BYTES + 1);
        let mut cursor = Cursor::new(raw.into_bytes());
        let err = read_message(&mut cursor).expect_err("oversized frame must fail");
        assert!(err.to_string().contains("exceeds max allowed"));
    }

    #[test]
    fn rank_rejects_excessive_limit() {
        let state = temp_state();
        let err = call(
            &state,
            "rank_most_like",
            json!({ "biography_id": "x", "limit": MAX_RANK_LIMIT + 1 }),
        )
        .expect_err("excessive limit must fail");
        assert!(err.to_string().contains("limit exceeds max"));
    }

    #[test]
    fn oversized_prompt_and_bad_dates_are_rejected() {
        let state = temp_state();
        let huge = "a".repeat(MAX_PROMPT_BYTES + 1);
        let err = call(&state, "submit_ingest_prompt", json!({ "prompt": huge }))
            .expect_err("oversized prompt must fail");
        assert!(err.to_string().contains("prompt exceeds max"));

        let florence = create_person(&state, "Florence Nightingale");
        let err = call(
            &state,
            "add_phase",
            json!({ "biography_id": florence, "start": "spring 1854" }),
        )
        .expect_err("non-ISO date must fail");
        assert!(err.to_string().contains("ISO date"));
    }

    #[test]
    fn unknown_tool_and_method() {
        let state = temp_state();
        assert!(call(&state, "remember", json!({})).is_err());
        let response = handle_request(
            &state,
            &json!({ "jsonrpc": "2.0", "id": 1, "method": "resources/list" }),
        )
        .unwrap();
        assert_eq!(response["error"]["code"], -32601);
        assert!(handle_request(
            &state,
            &json!({ "jsonrpc": "2.0", "method": "notifications/initialized" })
        )
        .is_none());
    }
}
