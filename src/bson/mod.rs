//! # Document Value Model
//!
//! Tagged value union over the document types the engine stores, with the
//! cross-type total ordering used by the index service, plus two codecs:
//!
//! - [`document`]: the standard BSON wire framing used for document payloads
//!   stored in data blocks (`decode(encode(d)) == d`, bit-exact).
//! - the compact index-key codec in [`value`], used to inline keys into
//!   index nodes (bounded by `MAX_INDEX_KEY_LENGTH`).
//!
//! ## Cross-type ordering
//!
//! ```text
//! MinValue < Null < Number < String < Document < Array
//!          < Binary/Guid < ObjectId < Boolean < DateTime < MaxValue
//! ```
//!
//! Numeric variants (Int32, Int64, Double) compare by value across types;
//! strings compare under the collection's collation.

mod document;
mod value;

pub use document::BsonDocument;
pub use value::BsonValue;
