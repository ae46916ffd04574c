//! Bencode encoding and decoding ([BEP-3]).
//!
//! Bencode carries `.torrent` files, tracker responses and the payloads of
//! extension messages. [`decode`] insists the whole input is one value, while
//! [`decode_prefix`] stops after the first value and reports how many bytes it
//! consumed, which is what BEP-9 metadata messages need since raw piece data
//! trails the dictionary.
//!
//! ```
//! use torrent_stream::bencode::{decode, encode, Value};
//!
//! let value = decode(b"d3:cow3:mooe").unwrap();
//! assert_eq!(value.get_str(b"cow"), Some("moo"));
//! assert_eq!(encode(&value), b"d3:cow3:mooe");
//! ```
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod decode;
mod encode;
mod error;
mod value;

pub use decode::{decode, decode_prefix};
pub use encode::encode;
pub use error::BencodeError;
pub use value::Value;

#[cfg(test)]
mod tests;
