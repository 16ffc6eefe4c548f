//! Versioned wire format
//!
//! A payload is a 4-byte ASCII format tag followed by a topological
//! node-array JSON document: node 0 is the root, objects are maps of
//! key to node index, lists are arrays of node indices, and rich types
//! are tagged arrays whose first element is a type tag string. Readers
//! reject unknown format tags; input without a tag that parses as a
//! bare JSON array is accepted as the legacy shape. Writes always
//! produce the tagged format.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::Value as Json;

use crate::class::ClassRegistry;
use crate::error::{DeserializationError, SerializationError};
use crate::value::{
    BigIntValue, BytesValue, ClassInstanceRef, CodecValue, DateValue, ErrorValue, RequestValue,
    ResponseValue, StepRefValue, StreamKind, StreamValue, TypedArrayKind,
};

/// The only format tag this reader currently understands
pub const FORMAT_TAG: &[u8; 4] = b"devl";

/// How stream references revive on the receiving side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRevival {
    /// Opaque placeholder; reads are forbidden (deterministic sandbox)
    Placeholder,
    /// Reference into the stream store; the engine attaches readers
    Store,
}

/// Encode a value into the tagged envelope.
///
/// Streams must already carry names; the boundary layer assigns them and
/// schedules the content pump before calling into the wire format.
pub fn encode_envelope(
    value: &CodecValue,
    classes: &ClassRegistry,
) -> Result<Vec<u8>, SerializationError> {
    let mut nodes: Vec<Json> = Vec::new();
    encode_node(value, classes, &mut nodes)?;

    let payload = serde_json::to_vec(&nodes)
        .map_err(|e| SerializationError::Encoding(e.to_string()))?;

    let mut bytes = Vec::with_capacity(4 + payload.len());
    bytes.extend_from_slice(FORMAT_TAG);
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decode an envelope, accepting the current tagged format and the
/// legacy bare-array shape.
pub fn decode_envelope(
    bytes: &[u8],
    classes: &ClassRegistry,
    revival: StreamRevival,
) -> Result<CodecValue, DeserializationError> {
    let payload = if bytes.len() >= 4 && &bytes[..4] == FORMAT_TAG {
        &bytes[4..]
    } else if bytes.first().copied() == Some(b'[') {
        // Legacy shape: the bare node array without a format tag.
        bytes
    } else if bytes.len() >= 4 && bytes[..4].iter().all(|b| b.is_ascii_lowercase()) {
        return Err(DeserializationError::UnknownFormatTag {
            tag: String::from_utf8_lossy(&bytes[..4]).into_owned(),
        });
    } else {
        return Err(DeserializationError::malformed(
            "payload is neither a tagged envelope nor a legacy array",
        ));
    };

    let nodes: Vec<Json> = serde_json::from_slice(payload)
        .map_err(|e| DeserializationError::Malformed(e.to_string()))?;
    if nodes.is_empty() {
        return Err(DeserializationError::malformed("empty node array"));
    }

    let mut in_progress = vec![false; nodes.len()];
    decode_node(0, &nodes, classes, revival, &mut in_progress)
}

fn push_node(nodes: &mut Vec<Json>, node: Json) -> usize {
    nodes.push(node);
    nodes.len() - 1
}

fn encode_node(
    value: &CodecValue,
    classes: &ClassRegistry,
    nodes: &mut Vec<Json>,
) -> Result<usize, SerializationError> {
    // Reserve the slot first so the root lands at index 0 and parents
    // precede their children.
    let slot = push_node(nodes, Json::Null);

    let node = match value {
        CodecValue::Null => Json::Null,
        CodecValue::Bool(b) => Json::from(*b),
        CodecValue::Int(i) => Json::from(*i),
        CodecValue::Float(f) => {
            if f.is_nan() {
                tagged(["Num", "nan"])
            } else if f.is_infinite() {
                tagged(["Num", if *f > 0.0 { "inf" } else { "-inf" }])
            } else {
                serde_json::Number::from_f64(*f)
                    .map(Json::Number)
                    .unwrap_or(Json::Null)
            }
        }
        CodecValue::BigInt(BigIntValue(digits)) => tagged(["BigInt", digits.as_str()]),
        CodecValue::String(s) => Json::from(s.as_str()),
        CodecValue::Bytes(BytesValue { kind, data }) => Json::Array(vec![
            Json::from("Bytes"),
            Json::from(kind.as_str()),
            Json::from(BASE64.encode(data)),
        ]),
        CodecValue::Date(DateValue::Valid(ts)) => tagged(["Date", &ts.to_rfc3339()]),
        CodecValue::Date(DateValue::Invalid) => {
            Json::Array(vec![Json::from("Date"), Json::Null])
        }
        CodecValue::Url(url) => tagged(["Url", url.as_str()]),
        CodecValue::UrlSearch(pairs) => {
            Json::Array(vec![Json::from("UrlSearch"), pairs_json(pairs)])
        }
        CodecValue::Regex { source, flags } => {
            tagged(["Regex", source.as_str(), flags.as_str()])
        }
        CodecValue::Error(err) => {
            let body = serde_json::to_value(err)
                .map_err(|e| SerializationError::Encoding(e.to_string()))?;
            Json::Array(vec![Json::from("Error"), body])
        }
        CodecValue::List(items) => {
            let mut indices = Vec::with_capacity(items.len());
            for item in items {
                indices.push(Json::from(encode_node(item, classes, nodes)?));
            }
            Json::Array(indices)
        }
        CodecValue::Object(entries) => {
            let mut map = serde_json::Map::with_capacity(entries.len());
            for (key, item) in entries {
                map.insert(key.clone(), Json::from(encode_node(item, classes, nodes)?));
            }
            Json::Object(map)
        }
        CodecValue::Map(entries) => {
            let mut parts = vec![Json::from("Map")];
            for (key, item) in entries {
                parts.push(Json::from(encode_node(key, classes, nodes)?));
                parts.push(Json::from(encode_node(item, classes, nodes)?));
            }
            Json::Array(parts)
        }
        CodecValue::Set(items) => {
            let mut parts = vec![Json::from("Set")];
            for item in items {
                parts.push(Json::from(encode_node(item, classes, nodes)?));
            }
            Json::Array(parts)
        }
        CodecValue::Headers(pairs) => {
            Json::Array(vec![Json::from("Headers"), pairs_json(pairs)])
        }
        CodecValue::Request(req) => {
            let body = match &req.body {
                Some(body) => Json::from(encode_node(body, classes, nodes)?),
                None => Json::Null,
            };
            Json::Array(vec![
                Json::from("Request"),
                Json::from(req.method.as_str()),
                Json::from(req.url.as_str()),
                pairs_json(&req.headers),
                body,
            ])
        }
        CodecValue::Response(res) => {
            let body = match &res.body {
                Some(body) => Json::from(encode_node(body, classes, nodes)?),
                None => Json::Null,
            };
            Json::Array(vec![
                Json::from("Response"),
                Json::from(res.status),
                pairs_json(&res.headers),
                body,
            ])
        }
        CodecValue::Stream(stream) => {
            let name = stream.name().ok_or(SerializationError::NoStreamEnvironment)?;
            tagged(["Stream", &name, stream.kind.as_str()])
        }
        CodecValue::StepRef(step) => {
            let closure = match &step.closure_vars {
                Some(vars) => Json::from(encode_node(vars, classes, nodes)?),
                None => Json::Null,
            };
            Json::Array(vec![
                Json::from("Step"),
                Json::from(step.step_id.as_str()),
                closure,
            ])
        }
        CodecValue::Instance(inst) => {
            let data = classes.encode_instance(inst)?;
            let data_idx = encode_node(&data, classes, nodes)?;
            Json::Array(vec![
                Json::from("Class"),
                Json::from(inst.class_id.as_str()),
                Json::from(data_idx),
            ])
        }
        CodecValue::Opaque(opaque) => {
            // Pass unknown classes through unchanged so nothing is lost.
            let data_idx = encode_node(&opaque.data, classes, nodes)?;
            Json::Array(vec![
                Json::from("Class"),
                Json::from(opaque.class_id.as_str()),
                Json::from(data_idx),
            ])
        }
    };

    nodes[slot] = node;
    Ok(slot)
}

fn tagged<'a>(parts: impl IntoIterator<Item = &'a str>) -> Json {
    Json::Array(parts.into_iter().map(Json::from).collect())
}

fn pairs_json(pairs: &[(String, String)]) -> Json {
    Json::Array(
        pairs
            .iter()
            .map(|(k, v)| Json::Array(vec![Json::from(k.as_str()), Json::from(v.as_str())]))
            .collect(),
    )
}

fn decode_node(
    index: usize,
    nodes: &[Json],
    classes: &ClassRegistry,
    revival: StreamRevival,
    in_progress: &mut [bool],
) -> Result<CodecValue, DeserializationError> {
    let node = nodes
        .get(index)
        .ok_or(DeserializationError::BadNodeIndex(index))?;
    if in_progress[index] {
        return Err(DeserializationError::malformed("cyclic node reference"));
    }
    in_progress[index] = true;
    let result = decode_node_inner(node, nodes, classes, revival, in_progress);
    in_progress[index] = false;
    result
}

fn child_index(json: &Json) -> Result<usize, DeserializationError> {
    json.as_u64()
        .map(|v| v as usize)
        .ok_or_else(|| DeserializationError::malformed("expected node index"))
}

fn decode_node_inner(
    node: &Json,
    nodes: &[Json],
    classes: &ClassRegistry,
    revival: StreamRevival,
    in_progress: &mut [bool],
) -> Result<CodecValue, DeserializationError> {
    match node {
        Json::Null => Ok(CodecValue::Null),
        Json::Bool(b) => Ok(CodecValue::Bool(*b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(CodecValue::Int(i))
            } else {
                Ok(CodecValue::Float(n.as_f64().unwrap_or(f64::NAN)))
            }
        }
        Json::String(s) => Ok(CodecValue::String(s.clone())),
        Json::Object(entries) => {
            let mut out = Vec::with_capacity(entries.len());
            for (key, idx) in entries {
                let child =
                    decode_node(child_index(idx)?, nodes, classes, revival, in_progress)?;
                out.push((key.clone(), child));
            }
            Ok(CodecValue::Object(out))
        }
        Json::Array(parts) => {
            // A leading string marks a tagged form; otherwise this is a
            // plain list of node indices.
            match parts.first() {
                Some(Json::String(tag)) => {
                    decode_tagged(tag, parts, nodes, classes, revival, in_progress)
                }
                _ => {
                    let mut out = Vec::with_capacity(parts.len());
                    for idx in parts {
                        out.push(decode_node(
                            child_index(idx)?,
                            nodes,
                            classes,
                            revival,
                            in_progress,
                        )?);
                    }
                    Ok(CodecValue::List(out))
                }
            }
        }
    }
}

fn str_operand<'a>(parts: &'a [Json], at: usize, tag: &str) -> Result<&'a str, DeserializationError> {
    parts
        .get(at)
        .and_then(Json::as_str)
        .ok_or_else(|| DeserializationError::malformed(format!("{tag}: bad operand {at}")))
}

fn pairs_operand(
    parts: &[Json],
    at: usize,
    tag: &str,
) -> Result<Vec<(String, String)>, DeserializationError> {
    let list = parts
        .get(at)
        .and_then(Json::as_array)
        .ok_or_else(|| DeserializationError::malformed(format!("{tag}: bad pair list")))?;
    list.iter()
        .map(|entry| {
            let pair = entry
                .as_array()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| DeserializationError::malformed(format!("{tag}: bad pair")))?;
            let k = pair[0]
                .as_str()
                .ok_or_else(|| DeserializationError::malformed(format!("{tag}: bad pair key")))?;
            let v = pair[1]
                .as_str()
                .ok_or_else(|| DeserializationError::malformed(format!("{tag}: bad pair value")))?;
            Ok((k.to_string(), v.to_string()))
        })
        .collect()
}

fn decode_tagged(
    tag: &str,
    parts: &[Json],
    nodes: &[Json],
    classes: &ClassRegistry,
    revival: StreamRevival,
    in_progress: &mut [bool],
) -> Result<CodecValue, DeserializationError> {
    match tag {
        "Num" => match str_operand(parts, 1, tag)? {
            "nan" => Ok(CodecValue::Float(f64::NAN)),
            "inf" => Ok(CodecValue::Float(f64::INFINITY)),
            "-inf" => Ok(CodecValue::Float(f64::NEG_INFINITY)),
            other => Err(DeserializationError::malformed(format!(
                "Num: unknown sentinel {other}"
            ))),
        },
        "BigInt" => Ok(CodecValue::BigInt(BigIntValue(
            str_operand(parts, 1, tag)?.to_string(),
        ))),
        "Date" => match parts.get(1) {
            Some(Json::Null) => Ok(CodecValue::Date(DateValue::Invalid)),
            Some(Json::String(iso)) => {
                let ts = DateTime::parse_from_rfc3339(iso)
                    .map_err(|e| DeserializationError::malformed(format!("Date: {e}")))?
                    .with_timezone(&Utc);
                Ok(CodecValue::Date(DateValue::Valid(ts)))
            }
            _ => Err(DeserializationError::malformed("Date: bad operand")),
        },
        "Bytes" => {
            let kind = TypedArrayKind::parse(str_operand(parts, 1, tag)?)
                .ok_or_else(|| DeserializationError::malformed("Bytes: unknown kind"))?;
            let data = BASE64
                .decode(str_operand(parts, 2, tag)?)
                .map_err(|e| DeserializationError::malformed(format!("Bytes: {e}")))?;
            Ok(CodecValue::Bytes(BytesValue { kind, data }))
        }
        "Url" => Ok(CodecValue::Url(str_operand(parts, 1, tag)?.to_string())),
        "UrlSearch" => Ok(CodecValue::UrlSearch(pairs_operand(parts, 1, tag)?)),
        "Regex" => Ok(CodecValue::Regex {
            source: str_operand(parts, 1, tag)?.to_string(),
            flags: str_operand(parts, 2, tag)?.to_string(),
        }),
        "Error" => {
            let body = parts
                .get(1)
                .cloned()
                .ok_or_else(|| DeserializationError::malformed("Error: missing body"))?;
            let err: ErrorValue = serde_json::from_value(body)
                .map_err(|e| DeserializationError::malformed(format!("Error: {e}")))?;
            Ok(CodecValue::Error(err))
        }
        "Map" => {
            let operands = &parts[1..];
            if operands.len() % 2 != 0 {
                return Err(DeserializationError::malformed("Map: odd operand count"));
            }
            let mut out = Vec::with_capacity(operands.len() / 2);
            for pair in operands.chunks(2) {
                let key =
                    decode_node(child_index(&pair[0])?, nodes, classes, revival, in_progress)?;
                let value =
                    decode_node(child_index(&pair[1])?, nodes, classes, revival, in_progress)?;
                out.push((key, value));
            }
            Ok(CodecValue::Map(out))
        }
        "Set" => {
            let mut out = Vec::with_capacity(parts.len().saturating_sub(1));
            for idx in &parts[1..] {
                out.push(decode_node(
                    child_index(idx)?,
                    nodes,
                    classes,
                    revival,
                    in_progress,
                )?);
            }
            Ok(CodecValue::Set(out))
        }
        "Headers" => Ok(CodecValue::Headers(pairs_operand(parts, 1, tag)?)),
        "Request" => {
            let body = match parts.get(4) {
                Some(Json::Null) | None => None,
                Some(idx) => Some(decode_node(
                    child_index(idx)?,
                    nodes,
                    classes,
                    revival,
                    in_progress,
                )?),
            };
            Ok(CodecValue::Request(Box::new(RequestValue {
                method: str_operand(parts, 1, tag)?.to_string(),
                url: str_operand(parts, 2, tag)?.to_string(),
                headers: pairs_operand(parts, 3, tag)?,
                body,
            })))
        }
        "Response" => {
            let status = parts
                .get(1)
                .and_then(Json::as_u64)
                .ok_or_else(|| DeserializationError::malformed("Response: bad status"))?
                as u16;
            let body = match parts.get(3) {
                Some(Json::Null) | None => None,
                Some(idx) => Some(decode_node(
                    child_index(idx)?,
                    nodes,
                    classes,
                    revival,
                    in_progress,
                )?),
            };
            Ok(CodecValue::Response(Box::new(ResponseValue {
                status,
                headers: pairs_operand(parts, 2, tag)?,
                body,
            })))
        }
        "Stream" => {
            let name = str_operand(parts, 1, tag)?;
            let kind = StreamKind::parse(str_operand(parts, 2, tag)?)
                .ok_or_else(|| DeserializationError::malformed("Stream: unknown kind"))?;
            let stream = match revival {
                StreamRevival::Placeholder => StreamValue::placeholder(name, kind),
                StreamRevival::Store => StreamValue::named(name, kind),
            };
            Ok(CodecValue::Stream(stream))
        }
        "Step" => {
            let closure_vars = match parts.get(2) {
                Some(Json::Null) | None => None,
                Some(idx) => Some(Box::new(decode_node(
                    child_index(idx)?,
                    nodes,
                    classes,
                    revival,
                    in_progress,
                )?)),
            };
            Ok(CodecValue::StepRef(StepRefValue {
                step_id: str_operand(parts, 1, tag)?.to_string(),
                closure_vars,
            }))
        }
        "Class" => {
            let class_id = str_operand(parts, 1, tag)?;
            let data_idx = child_index(
                parts
                    .get(2)
                    .ok_or_else(|| DeserializationError::malformed("Class: missing data"))?,
            )?;
            let data = decode_node(data_idx, nodes, classes, revival, in_progress)?;
            match classes.decode_instance(class_id, data.clone()) {
                Some(Ok(inst)) => Ok(CodecValue::Instance(inst)),
                Some(Err(err)) => Err(err),
                None => Ok(CodecValue::Opaque(ClassInstanceRef {
                    class_id: class_id.to_string(),
                    data: Box::new(data),
                })),
            }
        }
        other => Err(DeserializationError::UnknownTypeTag(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: CodecValue) -> CodecValue {
        let classes = ClassRegistry::new();
        let bytes = encode_envelope(&value, &classes).unwrap();
        assert_eq!(&bytes[..4], FORMAT_TAG);
        decode_envelope(&bytes, &classes, StreamRevival::Store).unwrap()
    }

    #[test]
    fn test_scalar_round_trips() {
        for value in [
            CodecValue::Null,
            CodecValue::Bool(true),
            CodecValue::Int(-42),
            CodecValue::Float(2.5),
            CodecValue::String("hello".into()),
            CodecValue::BigInt(BigIntValue("-170141183460469231731687303715884105728".into())),
            CodecValue::BigInt(BigIntValue("99999999999999999999".into())),
        ] {
            assert_eq!(round_trip(value.clone()), value);
        }
    }

    #[test]
    fn test_non_finite_floats() {
        assert_eq!(
            round_trip(CodecValue::Float(f64::INFINITY)),
            CodecValue::Float(f64::INFINITY)
        );
        let nan = round_trip(CodecValue::Float(f64::NAN));
        match nan {
            CodecValue::Float(f) => assert!(f.is_nan()),
            other => panic!("expected float, got {other:?}"),
        }
    }

    #[test]
    fn test_date_round_trips() {
        let ts = DateTime::parse_from_rfc3339("2024-05-01T12:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            round_trip(CodecValue::Date(DateValue::Valid(ts))),
            CodecValue::Date(DateValue::Valid(ts))
        );
        assert_eq!(
            round_trip(CodecValue::Date(DateValue::Invalid)),
            CodecValue::Date(DateValue::Invalid)
        );
    }

    #[test]
    fn test_containers_round_trip() {
        let value = CodecValue::object([
            (
                "map",
                CodecValue::Map(vec![(
                    CodecValue::String("k".into()),
                    CodecValue::List(vec![CodecValue::Int(1), CodecValue::Null]),
                )]),
            ),
            (
                "set",
                CodecValue::Set(vec![CodecValue::Int(1), CodecValue::Int(2)]),
            ),
            (
                "bytes",
                CodecValue::Bytes(BytesValue::plain(vec![0, 1, 2, 255])),
            ),
            ("empty_bytes", CodecValue::Bytes(BytesValue::plain(vec![]))),
            (
                "headers",
                CodecValue::Headers(vec![
                    ("set-cookie".into(), "a=1".into()),
                    ("set-cookie".into(), "b=2".into()),
                ]),
            ),
            ("search", CodecValue::UrlSearch(vec![])),
        ]);
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn test_typed_array_kinds_round_trip() {
        for kind in [
            TypedArrayKind::U8,
            TypedArrayKind::I16,
            TypedArrayKind::F64,
            TypedArrayKind::ArrayBuffer,
        ] {
            let value = CodecValue::Bytes(BytesValue {
                kind,
                data: vec![1, 2, 3, 4, 5, 6, 7, 8],
            });
            assert_eq!(round_trip(value.clone()), value);
        }
    }

    #[test]
    fn test_url_regex_error_round_trip() {
        let value = CodecValue::List(vec![
            CodecValue::Url("https://example.com/a?b=c".into()),
            CodecValue::UrlSearch(vec![("q".into(), "1".into()), ("q".into(), "2".into())]),
            CodecValue::Regex {
                source: r"\d+".into(),
                flags: "gi".into(),
            },
            CodecValue::Error(
                ErrorValue::new("step blew up")
                    .with_code("E_STEP")
                    .with_stack("at charge()"),
            ),
        ]);
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn test_request_response_round_trip() {
        let value = CodecValue::Request(Box::new(RequestValue {
            method: "POST".into(),
            url: "https://example.com/hook".into(),
            headers: vec![("content-type".into(), "application/json".into())],
            body: Some(CodecValue::Bytes(BytesValue::plain(b"{}".to_vec()))),
        }));
        assert_eq!(round_trip(value.clone()), value);

        let value = CodecValue::Response(Box::new(ResponseValue {
            status: 202,
            headers: vec![],
            body: None,
        }));
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn test_step_ref_round_trip() {
        let value = CodecValue::StepRef(
            StepRefValue::new("step//./src/jobs//charge").with_closure(CodecValue::Int(5)),
        );
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn test_stream_revival_modes() {
        let classes = ClassRegistry::new();
        let value = CodecValue::Stream(StreamValue::named("strm_x", StreamKind::Readable));
        let bytes = encode_envelope(&value, &classes).unwrap();

        let sandbox = decode_envelope(&bytes, &classes, StreamRevival::Placeholder).unwrap();
        match sandbox {
            CodecValue::Stream(s) => assert!(s.is_placeholder()),
            other => panic!("expected stream, got {other:?}"),
        }

        let external = decode_envelope(&bytes, &classes, StreamRevival::Store).unwrap();
        match external {
            CodecValue::Stream(s) => assert!(!s.is_placeholder()),
            other => panic!("expected stream, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_class_surfaces_as_opaque() {
        let classes = ClassRegistry::new();
        let value = CodecValue::Opaque(ClassInstanceRef {
            class_id: "class//./src/x//Widget".into(),
            data: Box::new(CodecValue::Int(9)),
        });
        let bytes = encode_envelope(&value, &classes).unwrap();
        let revived = decode_envelope(&bytes, &classes, StreamRevival::Store).unwrap();
        assert_eq!(revived, value);
    }

    #[test]
    fn test_unknown_format_tag_rejected() {
        let err = decode_envelope(b"zzzz[0]", &ClassRegistry::new(), StreamRevival::Store)
            .unwrap_err();
        assert!(matches!(err, DeserializationError::UnknownFormatTag { .. }));
    }

    #[test]
    fn test_legacy_bare_array_accepted() {
        let classes = ClassRegistry::new();
        let bytes = encode_envelope(&CodecValue::Int(7), &classes).unwrap();
        // Strip the tag to simulate a legacy payload.
        let revived = decode_envelope(&bytes[4..], &classes, StreamRevival::Store).unwrap();
        assert_eq!(revived, CodecValue::Int(7));
    }

    #[test]
    fn test_unknown_type_tag_rejected() {
        let payload = br#"devl[["Wormhole",0]]"#;
        let err =
            decode_envelope(payload, &ClassRegistry::new(), StreamRevival::Store).unwrap_err();
        assert!(matches!(err, DeserializationError::UnknownTypeTag(_)));
    }

    #[test]
    fn test_cyclic_node_reference_rejected() {
        let payload = br#"devl[[0]]"#;
        let err =
            decode_envelope(payload, &ClassRegistry::new(), StreamRevival::Store).unwrap_err();
        assert!(matches!(err, DeserializationError::Malformed(_)));
    }
}
