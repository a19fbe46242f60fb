//! JSON record codecs
//!
//! Member records are stored as `{"id","addr"}` and shard records as
//! `{"id","status","owner","revision"}`. Boolean flags are written only when
//! set, so records produced by older writers decode unchanged.

use serde::{Deserialize, Serialize};

use crate::models::{
    MemberExtra, MemberId, MemberInfo, ShardExtra, ShardId, ShardInfo, ShardRevision,
    ShardStatus,
};

fn is_false(flag: &bool) -> bool {
    !*flag
}

#[derive(Serialize, Deserialize)]
struct MemberRecord {
    id: String,
    addr: String,
    #[serde(default, skip_serializing_if = "is_false")]
    prepare_to_leave: bool,
}

#[derive(Serialize, Deserialize)]
struct ShardRecord {
    id: u32,
    #[serde(with = "status_code")]
    status: ShardStatus,
    #[serde(default)]
    owner: String,
    revision: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    prepare_to_drop: bool,
}

mod status_code {
    use serde::{de, Deserialize, Deserializer, Serializer};

    use crate::models::ShardStatus;

    pub fn serialize<S: Serializer>(status: &ShardStatus, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(status.code())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<ShardStatus, D::Error> {
        let code = u8::deserialize(d)?;
        ShardStatus::from_code(code)
            .ok_or_else(|| de::Error::custom(format!("unknown shard status {code}")))
    }
}

pub fn encode_member(info: &MemberInfo) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&MemberRecord {
        id: info.id.as_str().to_string(),
        addr: info.addr.clone(),
        prepare_to_leave: info.extra.prepare_to_leave,
    })
}

pub fn decode_member(data: &[u8]) -> Result<MemberInfo, serde_json::Error> {
    let record: MemberRecord = serde_json::from_slice(data)?;
    Ok(MemberInfo {
        id: MemberId::from(record.id),
        addr: record.addr,
        extra: MemberExtra {
            prepare_to_leave: record.prepare_to_leave,
        },
    })
}

pub fn encode_shard(info: &ShardInfo) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&ShardRecord {
        id: info.id.0,
        status: info.status,
        owner: info
            .owner
            .as_ref()
            .map(|m| m.as_str().to_string())
            .unwrap_or_default(),
        revision: info.revision.0,
        prepare_to_drop: info.extra.prepare_to_drop,
    })
}

pub fn decode_shard(data: &[u8]) -> Result<ShardInfo, serde_json::Error> {
    let record: ShardRecord = serde_json::from_slice(data)?;
    Ok(ShardInfo {
        id: ShardId(record.id),
        status: record.status,
        // Empty owner means the shard has none
        owner: (!record.owner.is_empty()).then(|| MemberId::from(record.owner)),
        revision: ShardRevision(record.revision),
        extra: ShardExtra {
            prepare_to_drop: record.prepare_to_drop,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_encoding() {
        let info = MemberInfo::new("21", "addr01:2000");
        let data = encode_member(&info).unwrap();
        assert_eq!(
            std::str::from_utf8(&data).unwrap(),
            r#"{"id":"21","addr":"addr01:2000"}"#
        );
        assert_eq!(decode_member(&data).unwrap(), info);
    }

    #[test]
    fn test_member_leave_flag() {
        let mut info = MemberInfo::new("21", "addr01:2000");
        info.extra.prepare_to_leave = true;

        let data = encode_member(&info).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(value["prepare_to_leave"], serde_json::Value::Bool(true));
        assert_eq!(decode_member(&data).unwrap(), info);
    }

    #[test]
    fn test_shard_encoding_with_drop_flag() {
        let info = ShardInfo {
            id: ShardId(5),
            status: ShardStatus::Active,
            owner: Some(MemberId::from("21")),
            revision: ShardRevision(11),
            extra: ShardExtra {
                prepare_to_drop: true,
            },
        };

        let data = encode_shard(&info).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "id": 5,
                "status": 1,
                "owner": "21",
                "revision": 11,
                "prepare_to_drop": true,
            })
        );
        assert_eq!(decode_shard(&data).unwrap(), info);
    }

    #[test]
    fn test_shard_drop_flag_omitted_when_false() {
        let info = ShardInfo {
            id: ShardId(2),
            status: ShardStatus::Active,
            owner: Some(MemberId::from("22")),
            revision: ShardRevision(32),
            extra: ShardExtra::default(),
        };

        let data = encode_shard(&info).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert!(value.get("prepare_to_drop").is_none());
        assert_eq!(decode_shard(&data).unwrap(), info);
    }

    #[test]
    fn test_unowned_shard() {
        let info = ShardInfo::unassigned(ShardId(3));
        let data = encode_shard(&info).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(value["owner"], "");
        assert_eq!(decode_shard(&data).unwrap(), info);
    }

    #[test]
    fn test_decode_rejects_bad_records() {
        assert!(decode_member(b"not json").is_err());
        assert!(decode_shard(br#"{"id":1,"status":7,"owner":"","revision":0}"#).is_err());
        assert!(decode_shard(br#"{"id":-1,"status":0,"owner":"","revision":0}"#).is_err());
    }
}
