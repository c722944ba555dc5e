//! Type-Encoding Parser
//!
//! Parses the compact textual type encodings attached to methods and blocks
//! into [`TypeNode`] trees. The module focuses on parsing; the node types are
//! defined in `crate::types`.
//!
//! Token table:
//!
//! ```text
//! v  void                       c  i8     s  i16    i  i32    q  i64
//! B  bool (u8)                  C  u8     S  u16    I  u32    Q  u64
//! f  f32                        d  f64
//! @  object reference           :  selector          *  C string
//! ^t pointer to t (pointee is consumed, the node stays opaque)
//! ?  anonymous callable (@? is the block spelling)
//! {name=fields} composite; {} is a valid zero-field composite
//! [Nt] array of N elements of t
//! ```
//!
//! Parsing is pure and iterative: nesting depth is bounded only by memory,
//! never by the call stack. Successful parses are memoized in a process-wide
//! content-addressed cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use thiserror::Error;

use crate::types::{Field, TypeNode, Width};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("unknown token {token:?} at offset {offset}")]
    UnknownToken { token: char, offset: usize },
    #[error("unbalanced composite or truncated encoding at offset {offset}")]
    UnbalancedComposite { offset: usize },
    #[error("invalid array count at offset {offset}")]
    InvalidArrayCount { offset: usize },
    #[error("empty encoding")]
    EmptyEncoding,
    #[error("trailing input at offset {offset}")]
    TrailingInput { offset: usize },
}

/// Parse a single type encoding. The whole input must be consumed.
pub fn parse(encoding: &str) -> Result<TypeNode, EncodingError> {
    let mut parser = Parser::new(encoding);
    let node = parser.parse_type()?;
    if parser.pos < parser.bytes.len() {
        return Err(EncodingError::TrailingInput { offset: parser.pos });
    }
    Ok(node)
}

/// Parse a full signature encoding: return type first, then each argument,
/// concatenated (e.g. `"i@:ii"` is `(ptr, ptr, i32, i32) -> i32`).
pub fn parse_signature(encoding: &str) -> Result<(TypeNode, Vec<TypeNode>), EncodingError> {
    if encoding.is_empty() {
        return Err(EncodingError::EmptyEncoding);
    }
    let mut parser = Parser::new(encoding);
    let ret = parser.parse_type()?;
    let mut args = Vec::new();
    while parser.pos < parser.bytes.len() {
        args.push(parser.parse_type()?);
    }
    Ok((ret, args))
}

/// Parse through the process-wide cache. Encodings are pure data, so the
/// cache is content-addressed and never evicted.
pub fn parse_cached(encoding: &str) -> Result<Arc<TypeNode>, EncodingError> {
    static CACHE: OnceLock<Mutex<HashMap<String, Arc<TypeNode>>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    if let Some(node) = cache.lock().unwrap().get(encoding) {
        return Ok(Arc::clone(node));
    }
    let node = Arc::new(parse(encoding)?);
    let mut guard = cache.lock().unwrap();
    let entry = guard
        .entry(encoding.to_string())
        .or_insert_with(|| Arc::clone(&node));
    Ok(Arc::clone(entry))
}

// ============================================================================
// Parser
// ============================================================================

/// In-progress compound type. One frame per open `{`, `[` or `^`.
enum Frame {
    Composite {
        name: Option<String>,
        fields: Vec<Field>,
    },
    Array {
        count: usize,
        open_offset: usize,
    },
    Pointer,
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    /// Parse exactly one type, advancing past it.
    ///
    /// The frame stack replaces recursion: a scalar token immediately yields
    /// a node; `{`, `[` and `^` push a frame; a completed node is folded into
    /// the innermost frame until no frames remain.
    fn parse_type(&mut self) -> Result<TypeNode, EncodingError> {
        let mut frames: Vec<Frame> = Vec::new();

        loop {
            let offset = self.pos;
            let byte = match self.bytes.get(self.pos) {
                Some(b) => *b,
                None => return Err(EncodingError::UnbalancedComposite { offset }),
            };
            self.pos += 1;

            let mut node = match byte {
                b'v' => TypeNode::Void,
                b'c' => TypeNode::int(Width::W8, true),
                b's' => TypeNode::int(Width::W16, true),
                b'i' => TypeNode::int(Width::W32, true),
                b'q' => TypeNode::int(Width::W64, true),
                b'B' | b'C' => TypeNode::int(Width::W8, false),
                b'S' => TypeNode::int(Width::W16, false),
                b'I' => TypeNode::int(Width::W32, false),
                b'Q' => TypeNode::int(Width::W64, false),
                b'f' => TypeNode::float(Width::W32),
                b'd' => TypeNode::float(Width::W64),
                b':' | b'*' => TypeNode::Pointer,
                b'@' => {
                    // "@?" is a block reference, bare "@" an object reference.
                    if self.bytes.get(self.pos) == Some(&b'?') {
                        self.pos += 1;
                        TypeNode::Callable
                    } else {
                        TypeNode::Pointer
                    }
                }
                b'?' => TypeNode::Callable,
                b'^' => {
                    frames.push(Frame::Pointer);
                    continue;
                }
                b'{' => {
                    let name = self.scan_composite_name();
                    frames.push(Frame::Composite {
                        name,
                        fields: Vec::new(),
                    });
                    continue;
                }
                b'}' => match frames.pop() {
                    Some(Frame::Composite { name, fields }) => {
                        TypeNode::Composite { name, fields }
                    }
                    _ => return Err(EncodingError::UnbalancedComposite { offset }),
                },
                b'[' => {
                    let count = self.scan_array_count(offset)?;
                    frames.push(Frame::Array {
                        count,
                        open_offset: offset,
                    });
                    continue;
                }
                other => {
                    return Err(EncodingError::UnknownToken {
                        token: other as char,
                        offset,
                    })
                }
            };

            // Fold the completed node into enclosing frames.
            loop {
                match frames.last_mut() {
                    None => return Ok(node),
                    Some(Frame::Composite { fields, .. }) => {
                        fields.push(Field::unnamed(node));
                        break;
                    }
                    Some(Frame::Pointer) => {
                        // The pointee was consumed; the node itself is opaque.
                        frames.pop();
                        node = TypeNode::Pointer;
                    }
                    Some(Frame::Array { count, open_offset }) => {
                        let count = *count;
                        let open_offset = *open_offset;
                        if self.bytes.get(self.pos) != Some(&b']') {
                            return Err(EncodingError::UnbalancedComposite {
                                offset: open_offset,
                            });
                        }
                        self.pos += 1;
                        frames.pop();
                        node = TypeNode::array(node, count);
                    }
                }
            }
        }
    }

    /// After an opening `{`, a run of name characters followed by `=` is the
    /// composite's name; otherwise the fields start immediately.
    fn scan_composite_name(&mut self) -> Option<String> {
        let mut end = self.pos;
        while let Some(&b) = self.bytes.get(end) {
            match b {
                b'=' => {
                    let name = std::str::from_utf8(&self.bytes[self.pos..end])
                        .ok()
                        .map(str::to_string);
                    self.pos = end + 1;
                    return name.filter(|n| !n.is_empty());
                }
                b'{' | b'}' | b'[' | b']' => return None,
                _ => end += 1,
            }
        }
        None
    }

    fn scan_array_count(&mut self, open_offset: usize) -> Result<usize, EncodingError> {
        let start = self.pos;
        while self
            .bytes
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_digit())
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(EncodingError::InvalidArrayCount { offset: open_offset });
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(EncodingError::InvalidArrayCount { offset: open_offset })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_tokens() {
        assert_eq!(parse("v").unwrap(), TypeNode::Void);
        assert_eq!(parse("i").unwrap(), TypeNode::int(Width::W32, true));
        assert_eq!(parse("Q").unwrap(), TypeNode::int(Width::W64, false));
        assert_eq!(parse("d").unwrap(), TypeNode::float(Width::W64));
        assert_eq!(parse("@").unwrap(), TypeNode::Pointer);
        assert_eq!(parse(":").unwrap(), TypeNode::Pointer);
        assert_eq!(parse("@?").unwrap(), TypeNode::Callable);
    }

    #[test]
    fn named_composite() {
        let node = parse("{point=dd}").unwrap();
        match &node {
            TypeNode::Composite { name, fields } => {
                assert_eq!(name.as_deref(), Some("point"));
                assert_eq!(fields.len(), 2);
            }
            other => panic!("expected composite, got {other:?}"),
        }
    }

    #[test]
    fn unnamed_and_empty_composites() {
        assert_eq!(
            parse("{dd}").unwrap(),
            TypeNode::composite(vec![
                Field::unnamed(TypeNode::float(Width::W64)),
                Field::unnamed(TypeNode::float(Width::W64)),
            ])
        );
        // A zero-field composite consumes its markers and is a valid type.
        let empty = parse("{}").unwrap();
        assert!(empty.is_empty_composite());
    }

    #[test]
    fn nested_composites_and_arrays() {
        let node = parse("{rect={point=dd}{size=dd}}").unwrap();
        match &node {
            TypeNode::Composite { name, fields } => {
                assert_eq!(name.as_deref(), Some("rect"));
                assert_eq!(fields.len(), 2);
                assert!(matches!(fields[0].ty, TypeNode::Composite { .. }));
            }
            other => panic!("expected composite, got {other:?}"),
        }

        assert_eq!(
            parse("[4i]").unwrap(),
            TypeNode::array(TypeNode::int(Width::W32, true), 4)
        );
        assert_eq!(
            parse("{=i[2{}]}").unwrap(),
            TypeNode::composite(vec![
                Field::unnamed(TypeNode::int(Width::W32, true)),
                Field::unnamed(TypeNode::array(TypeNode::composite(vec![]), 2)),
            ])
        );
    }

    #[test]
    fn pointer_consumes_its_pointee() {
        assert_eq!(parse("^i").unwrap(), TypeNode::Pointer);
        assert_eq!(parse("^{point=dd}").unwrap(), TypeNode::Pointer);
        assert_eq!(parse("^^i").unwrap(), TypeNode::Pointer);
    }

    #[test]
    fn unknown_token_reports_offset() {
        assert_eq!(
            parse("z"),
            Err(EncodingError::UnknownToken { token: 'z', offset: 0 })
        );
        assert_eq!(
            parse("{point=dx}"),
            Err(EncodingError::UnknownToken { token: 'x', offset: 8 })
        );
    }

    #[test]
    fn unbalanced_markers() {
        assert!(matches!(
            parse("{point=dd"),
            Err(EncodingError::UnbalancedComposite { .. })
        ));
        assert!(matches!(
            parse("}"),
            Err(EncodingError::UnbalancedComposite { offset: 0 })
        ));
        assert!(matches!(
            parse("[4i"),
            Err(EncodingError::UnbalancedComposite { .. })
        ));
        assert!(matches!(
            parse("^"),
            Err(EncodingError::UnbalancedComposite { .. })
        ));
    }

    #[test]
    fn bad_array_count() {
        assert_eq!(
            parse("[i]"),
            Err(EncodingError::InvalidArrayCount { offset: 0 })
        );
    }

    #[test]
    fn trailing_input_rejected_for_single_type() {
        assert_eq!(
            parse("ii"),
            Err(EncodingError::TrailingInput { offset: 1 })
        );
    }

    #[test]
    fn signature_encoding_splits_return_and_args() {
        let (ret, args) = parse_signature("i@:ii").unwrap();
        assert_eq!(ret, TypeNode::int(Width::W32, true));
        assert_eq!(
            args,
            vec![
                TypeNode::Pointer,
                TypeNode::Pointer,
                TypeNode::int(Width::W32, true),
                TypeNode::int(Width::W32, true),
            ]
        );

        let (ret, args) = parse_signature("v").unwrap();
        assert!(ret.is_void());
        assert!(args.is_empty());

        assert_eq!(parse_signature(""), Err(EncodingError::EmptyEncoding));
    }

    #[test]
    fn parsing_is_pure() {
        let a = parse("{rect={point=dd}{size=dd}}").unwrap();
        let b = parse("{rect={point=dd}{size=dd}}").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.sig_hash(), b.sig_hash());
    }

    #[test]
    fn cache_returns_shared_nodes() {
        let a = parse_cached("{point=dd}").unwrap();
        let b = parse_cached("{point=dd}").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(parse_cached("!!").is_err());
    }

    #[test]
    fn pathological_depth_parses_iteratively() {
        let depth = 100_000;
        let mut encoding = String::with_capacity(depth * 2 + 1);
        for _ in 0..depth {
            encoding.push('{');
        }
        encoding.push('i');
        for _ in 0..depth {
            encoding.push('}');
        }
        let node = parse(&encoding).unwrap();
        assert!(!node.is_empty_composite());
        // Dropping the tree here must not recurse per nesting level.
    }
}
