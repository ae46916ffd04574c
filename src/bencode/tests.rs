use bytes::Bytes;

use super::*;

#[test]
fn test_decode_scalars() {
    assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
    assert_eq!(decode(b"i-42e").unwrap(), Value::Integer(-42));
    assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Bytes::new()));
    assert_eq!(decode(b"4:spam").unwrap().as_str(), Some("spam"));
}

#[test]
fn test_decode_rejects_malformed_integers() {
    assert!(matches!(decode(b"i-0e"), Err(BencodeError::InvalidInteger(_))));
    assert!(matches!(decode(b"i03e"), Err(BencodeError::InvalidInteger(_))));
    assert!(matches!(decode(b"ie"), Err(BencodeError::InvalidInteger(_))));
    assert_eq!(decode(b"i12"), Err(BencodeError::UnexpectedEof));
}

#[test]
fn test_decode_string_longer_than_input() {
    assert_eq!(decode(b"10:short"), Err(BencodeError::UnexpectedEof));
}

#[test]
fn test_decode_nested() {
    let value = decode(b"d4:listl4:spami42ee3:numi7ee").unwrap();
    let list = value.get(b"list").and_then(Value::as_list).unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[1], Value::Integer(42));
    assert_eq!(value.get_integer(b"num"), Some(7));
}

#[test]
fn test_decode_rejects_non_string_keys() {
    assert_eq!(decode(b"di1e3:fooe"), Err(BencodeError::InvalidKey));
}

#[test]
fn test_decode_depth_limit() {
    let mut data = vec![b'l'; 100];
    data.extend(vec![b'e'; 100]);
    assert_eq!(decode(&data), Err(BencodeError::NestingTooDeep));
}

#[test]
fn test_trailing_data_error() {
    assert_eq!(decode(b"i42eextra"), Err(BencodeError::TrailingData));
}

#[test]
fn test_decode_prefix_reports_consumed() {
    let data = b"d8:msg_typei1e5:piecei0eeRAWDATA";
    let (value, consumed) = decode_prefix(data).unwrap();
    assert_eq!(value.get_integer(b"msg_type"), Some(1));
    assert_eq!(&data[consumed..], b"RAWDATA");
}

#[test]
fn test_encode_is_canonical() {
    let original = b"d8:announce15:http://test.com4:infod4:name4:test12:piece lengthi16384eee";
    let decoded = decode(original).unwrap();
    assert_eq!(encode(&decoded), original);
}

#[test]
fn test_encode_dict_builder_sorts_keys() {
    let value = Value::dict([
        ("zeta", Value::string("z")),
        ("alpha", Value::List(vec![Value::Integer(-1)])),
    ]);
    assert_eq!(encode(&value), b"d5:alphali-1ee4:zeta1:ze");
}
