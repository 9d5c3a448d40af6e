//! Query filters.
//!
//! Filters select which nodes a query applies to. They ride inside
//! [`QueryMessage`](crate::QueryMessage) as individually type-prefixed
//! blobs: one byte of [`FilterType`] followed by the postcard body. A
//! receiver that does not recognize a filter type drops the query rather
//! than guessing.

use serde::{Deserialize, Serialize};

use crate::{Result, WireError};

/// Type byte of an encoded filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FilterType {
    /// Body is a list of node names; the local name must be present.
    Node = 0,
    /// Body is a `{tag, regex}` pair; the local tag value must match.
    Tag = 1,
}

impl TryFrom<u8> for FilterType {
    type Error = WireError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            0 => FilterType::Node,
            1 => FilterType::Tag,
            other => return Err(WireError::UnknownFilterType(other)),
        })
    }
}

/// A decoded query filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filter {
    /// Restrict to the named nodes.
    Node(Vec<String>),

    /// Restrict to nodes whose value for `tag` matches `expr`.
    Tag {
        tag: String,
        /// Anchored by the caller if desired; evaluated as a standard
        /// regular expression against the tag value.
        expr: String,
    },
}

impl Filter {
    pub fn filter_type(&self) -> FilterType {
        match self {
            Filter::Node(_) => FilterType::Node,
            Filter::Tag { .. } => FilterType::Tag,
        }
    }
}

/// Encodes a filter as its type byte plus postcard body.
pub fn encode_filter(filter: &Filter) -> Result<Vec<u8>> {
    let mut buf = vec![filter.filter_type() as u8];
    let body = match filter {
        Filter::Node(names) => postcard::to_allocvec(names),
        Filter::Tag { tag, expr } => postcard::to_allocvec(&(tag, expr)),
    }
    .map_err(WireError::Encode)?;
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decodes a type-prefixed filter blob.
pub fn decode_filter(raw: &[u8]) -> Result<Filter> {
    let (&ty, body) = raw.split_first().ok_or(WireError::Truncated)?;
    match FilterType::try_from(ty)? {
        FilterType::Node => {
            let names: Vec<String> = postcard::from_bytes(body).map_err(WireError::Decode)?;
            Ok(Filter::Node(names))
        }
        FilterType::Tag => {
            let (tag, expr): (String, String) =
                postcard::from_bytes(body).map_err(WireError::Decode)?;
            Ok(Filter::Tag { tag, expr })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_filter_round_trip() {
        let filter = Filter::Node(vec!["a".into(), "b".into()]);
        let raw = encode_filter(&filter).unwrap();
        assert_eq!(raw[0], FilterType::Node as u8);
        assert_eq!(decode_filter(&raw).unwrap(), filter);
    }

    #[test]
    fn tag_filter_round_trip() {
        let filter = Filter::Tag {
            tag: "role".into(),
            expr: "^web$".into(),
        };
        let raw = encode_filter(&filter).unwrap();
        assert_eq!(raw[0], FilterType::Tag as u8);
        assert_eq!(decode_filter(&raw).unwrap(), filter);
    }

    #[test]
    fn unknown_filter_type_rejected() {
        assert!(decode_filter(&[7, 0, 0]).is_err());
        assert!(decode_filter(&[]).is_err());
    }
}
