//! # Internal Macros
//!
//! ## zerocopy_accessors!
//!
//! Generates getter and setter methods for zerocopy struct fields that use
//! little-endian wrapper types (U16, U32) or plain bytes.
//!
//! ### Usage
//!
//! ```ignore
//! use zerocopy::little_endian::{U16, U32};
//!
//! #[repr(C)]
//! struct Header {
//!     page_id: U32,
//!     used_bytes: U16,
//! }
//!
//! impl Header {
//!     zerocopy_accessors! {
//!         page_id: u32,
//!         used_bytes: u16,
//!     }
//! }
//!
//! // Generates:
//! // pub fn page_id(&self) -> u32 { self.page_id.get() }
//! // pub fn set_page_id(&mut self, val: u32) { self.page_id = U32::new(val); }
//! // ...
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u8) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u8 {
                self.$field
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u8) {
                self.$field = val;
            }
        }
    };
    (@impl $field:ident, u16) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u16 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u16) {
                self.$field = ::zerocopy::little_endian::U16::new(val);
            }
        }
    };
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::little_endian::U32::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}
