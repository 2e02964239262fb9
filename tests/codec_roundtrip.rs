//! Round-trip checks between the reader and writer halves of each codec.

use nbio::rdb::{RdbReader, RdbNextRes, RdbTy};
use nbio::rjson::{NextResult, RjsonReader, ValueType};
use nbio::wdb::WdbWriter;
use nbio::wjson::WjsonWriter;

#[test]
fn wjson_then_rjson_round_trips_an_object() {
    let mut w: WjsonWriter<256> = WjsonWriter::new(false);
    assert!(matches!(w.obj_start(), nbio::wjson::WjsonRes::Ok));
    assert!(matches!(w.str("a"), nbio::wjson::WjsonRes::Ok));
    assert!(matches!(w.arr_start(), nbio::wjson::WjsonRes::Ok));
    assert!(matches!(w.int(1), nbio::wjson::WjsonRes::Ok));
    assert!(matches!(w.int(2), nbio::wjson::WjsonRes::Ok));
    assert!(matches!(w.int(3), nbio::wjson::WjsonRes::Ok));
    assert!(matches!(w.arr_end(), nbio::wjson::WjsonRes::Ok));
    assert!(matches!(w.obj_end(), nbio::wjson::WjsonRes::Ok));

    let doc = w.out_str().to_string();
    assert_eq!(doc, "{\"a\":[1,2,3]}");

    let mut r: RjsonReader<64> = RjsonReader::new();
    let mut tys = Vec::new();
    for &b in doc.as_bytes() {
        match r.next(b) {
            NextResult::Ok => tys.push(r.cur_ty()),
            NextResult::Fin => {
                tys.push(ValueType::ObjEnd);
                break;
            }
            NextResult::Syntax => panic!("unexpected syntax error at {}", r.pos()),
        }
    }

    assert_eq!(
        tys,
        vec![
            ValueType::ObjStart,
            ValueType::Str,
            ValueType::ArrStart,
            ValueType::Num,
            ValueType::Num,
            ValueType::Num,
            ValueType::ArrEnd,
            ValueType::ObjEnd,
        ]
    );
}

#[test]
fn wdb_then_rdb_round_trips_a_record() {
    let mut w: WdbWriter<256> = WdbWriter::new();
    assert!(matches!(w.key("name"), nbio::wdb::WdbRes::Ok));
    assert!(matches!(w.str("hello"), nbio::wdb::WdbRes::Ok));
    assert!(matches!(w.key("xs"), nbio::wdb::WdbRes::Ok));
    assert!(matches!(w.int(1), nbio::wdb::WdbRes::Ok));
    assert!(matches!(w.int(2), nbio::wdb::WdbRes::Ok));
    assert!(matches!(w.fin(), nbio::wdb::WdbRes::Ok));

    let record = w.out_str().to_string();

    let mut r: RdbReader<64> = RdbReader::new();
    let mut keys = Vec::new();
    let mut strs = Vec::new();
    let mut nums = Vec::new();
    for &b in record.as_bytes() {
        match r.next(b) {
            RdbNextRes::Ok => match r.cur_ty() {
                RdbTy::Key => keys.push(r.cur_str().to_string()),
                RdbTy::Str => strs.push(r.cur_str().to_string()),
                RdbTy::Num => nums.push(r.cur_num()),
                _ => {}
            },
            RdbNextRes::Fin => break,
            RdbNextRes::Syntax => panic!("unexpected syntax error"),
        }
    }

    assert_eq!(keys, vec!["name", "xs"]);
    assert_eq!(strs, vec!["hello"]);
    assert_eq!(nums, vec![1.0, 2.0]);
}
