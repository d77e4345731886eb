//! Command dispatch.
//!
//! Parsed RESP arrays land here; each command validates its arguments,
//! runs one closed step against the storage engine, and shapes the reply.
//!
//! The per-field expiration family shares one argument grammar:
//!
//! ```text
//! HEXPIRE    key seconds      [NX|XX|GT|LT] FIELDS count field [field ...]
//! HPEXPIRE   key milliseconds [NX|XX|GT|LT] FIELDS count field [field ...]
//! HEXPIREAT  key unix-secs    [NX|XX|GT|LT] FIELDS count field [field ...]
//! HPEXPIREAT key unix-millis  [NX|XX|GT|LT] FIELDS count field [field ...]
//! HTTL | HPTTL | HEXPIRETIME | HPEXPIRETIME  key FIELDS count field ...
//! HPERSIST                                   key FIELDS count field ...
//! ```
//!
//! and replies one integer code per field. Accepted expiration commands are
//! re-propagated in absolute-millisecond `HPEXPIREAT` form, so replicas
//! apply the same deadline no matter when they replay the stream.

use crate::protocol::RespValue;
use crate::storage::db::{GetFieldRes, StoreError, TtlUnit};
use crate::storage::ebuckets::EXPIRE_TIME_MAX;
use crate::storage::hash::{ExpireSetCond, FieldSetCond, SetExRes};
use crate::storage::engine::StorageEngine;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Executes commands against the shared storage engine.
#[derive(Clone)]
pub struct CommandHandler {
    engine: Arc<StorageEngine>,
    start_time: Instant,
}

impl CommandHandler {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self { engine, start_time: Instant::now() }
    }

    /// Execute one parsed command and produce the reply.
    pub fn execute(&self, command: RespValue) -> RespValue {
        let RespValue::Array(args) = command else {
            return RespValue::error("ERR invalid command format");
        };
        if args.is_empty() {
            return RespValue::error("ERR empty command");
        }
        let Some(name) = args[0].as_str().map(str::to_uppercase) else {
            return RespValue::error("ERR invalid command name");
        };
        self.dispatch(&name, &args[1..])
    }

    fn dispatch(&self, cmd: &str, args: &[RespValue]) -> RespValue {
        match cmd {
            // Hash commands
            "HSET" => self.cmd_hset(args, false),
            "HMSET" => self.cmd_hset(args, true),
            "HSETNX" => self.cmd_hsetnx(args),
            "HGET" => self.cmd_hget(args),
            "HMGET" => self.cmd_hmget(args),
            "HDEL" => self.cmd_hdel(args),
            "HLEN" => self.cmd_hlen(args),
            "HSTRLEN" => self.cmd_hstrlen(args),
            "HEXISTS" => self.cmd_hexists(args),
            "HINCRBY" => self.cmd_hincrby(args),
            "HINCRBYFLOAT" => self.cmd_hincrbyfloat(args),
            "HGETALL" => self.cmd_hgetall("HGETALL", args, true, true),
            "HKEYS" => self.cmd_hgetall("HKEYS", args, true, false),
            "HVALS" => self.cmd_hgetall("HVALS", args, false, true),
            "HRANDFIELD" => self.cmd_hrandfield(args),
            "HSCAN" => self.cmd_hscan(args),

            // Per-field expiration family
            "HEXPIRE" => self.cmd_hexpire_generic("hexpire", args, TtlUnit::Seconds, false),
            "HPEXPIRE" => self.cmd_hexpire_generic("hpexpire", args, TtlUnit::Millis, false),
            "HEXPIREAT" => self.cmd_hexpire_generic("hexpireat", args, TtlUnit::Seconds, true),
            "HPEXPIREAT" => self.cmd_hexpire_generic("hpexpireat", args, TtlUnit::Millis, true),
            "HTTL" => self.cmd_httl_generic("httl", args, TtlUnit::Seconds, false),
            "HPTTL" => self.cmd_httl_generic("hpttl", args, TtlUnit::Millis, false),
            "HEXPIRETIME" => self.cmd_httl_generic("hexpiretime", args, TtlUnit::Seconds, true),
            "HPEXPIRETIME" => self.cmd_httl_generic("hpexpiretime", args, TtlUnit::Millis, true),
            "HPERSIST" => self.cmd_hpersist(args),

            // Keyspace commands
            "SET" => self.cmd_set(args),
            "GET" => self.cmd_get(args),
            "DEL" => self.cmd_del(args),
            "EXISTS" => self.cmd_exists(args),
            "TYPE" => self.cmd_type(args),
            "RENAME" => self.cmd_rename(args),
            "COPY" => self.cmd_copy(args),
            "OBJECT" => self.cmd_object(args),

            // Server commands
            "PING" => self.cmd_ping(args),
            "ECHO" => self.cmd_echo(args),
            "DBSIZE" => self.cmd_dbsize(args),
            "FLUSHDB" | "FLUSHALL" => self.cmd_flushdb(args),
            "INFO" => self.cmd_info(args),
            "TIME" => self.cmd_time(args),
            "CONFIG" => self.cmd_config(args),
            "QUIT" => RespValue::ok(),

            _ => RespValue::error(format!("ERR unknown command '{cmd}'")),
        }
    }

    // ========================================================================
    // Hash commands
    // ========================================================================

    /// HSET key field value [field value ...]  (HMSET replies +OK)
    fn cmd_hset(&self, args: &[RespValue], legacy_hmset: bool) -> RespValue {
        if args.len() < 3 || args.len() % 2 == 0 {
            return wrong_arity(if legacy_hmset { "HMSET" } else { "HSET" });
        }
        let Some(key) = bytes_arg(args, 0) else {
            return RespValue::error("ERR invalid key");
        };
        let mut pairs = Vec::with_capacity((args.len() - 1) / 2);
        for chunk in args[1..].chunks(2) {
            match (chunk[0].as_bytes(), chunk[1].as_bytes()) {
                (Some(f), Some(v)) => pairs.push((f, v)),
                _ => return RespValue::error("ERR invalid field or value"),
            }
        }
        match self.engine.command(|db| db.hset(&key, &pairs)) {
            Ok(_) if legacy_hmset => RespValue::ok(),
            Ok(created) => RespValue::int(created as i64),
            Err(e) => store_err(e),
        }
    }

    /// HSETNX key field value
    fn cmd_hsetnx(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 3 {
            return wrong_arity("HSETNX");
        }
        let (Some(key), Some(field), Some(value)) =
            (bytes_arg(args, 0), bytes_arg(args, 1), bytes_arg(args, 2))
        else {
            return RespValue::error("ERR invalid arguments");
        };
        match self.engine.command(|db| db.hsetnx(&key, &field, value)) {
            Ok(created) => RespValue::int(created as i64),
            Err(e) => store_err(e),
        }
    }

    /// HGET key field
    fn cmd_hget(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 2 {
            return wrong_arity("HGET");
        }
        let (Some(key), Some(field)) = (bytes_arg(args, 0), bytes_arg(args, 1)) else {
            return RespValue::error("ERR invalid arguments");
        };
        match self.engine.command(|db| db.hget(&key, &field)) {
            Ok(GetFieldRes::Ok(v)) => RespValue::bulk(v),
            Ok(_) => RespValue::Null,
            Err(e) => store_err(e),
        }
    }

    /// HMGET key field [field ...]
    fn cmd_hmget(&self, args: &[RespValue]) -> RespValue {
        if args.len() < 2 {
            return wrong_arity("HMGET");
        }
        let Some(key) = bytes_arg(args, 0) else {
            return RespValue::error("ERR invalid key");
        };
        let fields: Vec<Bytes> = match collect_bytes(&args[1..]) {
            Some(f) => f,
            None => return RespValue::error("ERR invalid field"),
        };
        self.engine.command(|db| {
            let mut out = Vec::with_capacity(fields.len());
            let mut hash_gone = false;
            for f in &fields {
                if hash_gone {
                    out.push(RespValue::Null);
                    continue;
                }
                match db.hget(&key, f) {
                    Ok(GetFieldRes::Ok(v)) => out.push(RespValue::bulk(v)),
                    Ok(GetFieldRes::ExpiredHash) => {
                        out.push(RespValue::Null);
                        hash_gone = true;
                    }
                    Ok(_) => out.push(RespValue::Null),
                    Err(e) => return store_err(e),
                }
            }
            RespValue::array(out)
        })
    }

    /// HDEL key field [field ...]
    fn cmd_hdel(&self, args: &[RespValue]) -> RespValue {
        if args.len() < 2 {
            return wrong_arity("HDEL");
        }
        let Some(key) = bytes_arg(args, 0) else {
            return RespValue::error("ERR invalid key");
        };
        let fields: Vec<Bytes> = match collect_bytes(&args[1..]) {
            Some(f) => f,
            None => return RespValue::error("ERR invalid field"),
        };
        match self.engine.command(|db| db.hdel(&key, &fields)) {
            Ok((deleted, _)) => RespValue::int(deleted as i64),
            Err(e) => store_err(e),
        }
    }

    /// HLEN key
    fn cmd_hlen(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 1 {
            return wrong_arity("HLEN");
        }
        let Some(key) = bytes_arg(args, 0) else {
            return RespValue::error("ERR invalid key");
        };
        match self.engine.command(|db| db.hlen(&key, false)) {
            Ok(n) => RespValue::int(n as i64),
            Err(e) => store_err(e),
        }
    }

    /// HSTRLEN key field
    fn cmd_hstrlen(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 2 {
            return wrong_arity("HSTRLEN");
        }
        let (Some(key), Some(field)) = (bytes_arg(args, 0), bytes_arg(args, 1)) else {
            return RespValue::error("ERR invalid arguments");
        };
        match self.engine.command(|db| db.hstrlen(&key, &field)) {
            Ok(n) => RespValue::int(n as i64),
            Err(e) => store_err(e),
        }
    }

    /// HEXISTS key field
    fn cmd_hexists(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 2 {
            return wrong_arity("HEXISTS");
        }
        let (Some(key), Some(field)) = (bytes_arg(args, 0), bytes_arg(args, 1)) else {
            return RespValue::error("ERR invalid arguments");
        };
        match self.engine.command(|db| db.hexists(&key, &field)) {
            Ok(found) => RespValue::int(found as i64),
            Err(e) => store_err(e),
        }
    }

    /// HINCRBY key field increment
    fn cmd_hincrby(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 3 {
            return wrong_arity("HINCRBY");
        }
        let (Some(key), Some(field)) = (bytes_arg(args, 0), bytes_arg(args, 1)) else {
            return RespValue::error("ERR invalid arguments");
        };
        let Some(delta) = args[2].as_int() else {
            return RespValue::error("ERR value is not an integer or out of range");
        };
        match self.engine.command(|db| db.hincrby(&key, &field, delta)) {
            Ok(n) => RespValue::int(n),
            Err(e) => store_err(e),
        }
    }

    /// HINCRBYFLOAT key field increment
    fn cmd_hincrbyfloat(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 3 {
            return wrong_arity("HINCRBYFLOAT");
        }
        let (Some(key), Some(field)) = (bytes_arg(args, 0), bytes_arg(args, 1)) else {
            return RespValue::error("ERR invalid arguments");
        };
        let incr = match args[2].as_str().and_then(|s| s.parse::<f64>().ok()) {
            Some(v) => v,
            None => return RespValue::error("ERR value is not a valid float"),
        };
        match self.engine.command(|db| db.hincrbyfloat(&key, &field, incr)) {
            Ok(v) => RespValue::bulk(v),
            Err(e) => store_err(e),
        }
    }

    /// HGETALL / HKEYS / HVALS
    fn cmd_hgetall(
        &self,
        cmd: &str,
        args: &[RespValue],
        want_fields: bool,
        want_values: bool,
    ) -> RespValue {
        if args.len() != 1 {
            return wrong_arity(cmd);
        }
        let Some(key) = bytes_arg(args, 0) else {
            return RespValue::error("ERR invalid key");
        };
        match self.engine.command(|db| db.hgetall(&key)) {
            Ok(None) => RespValue::Array(Vec::new()),
            Ok(Some(entries)) => {
                let mut out = Vec::new();
                for (f, v) in entries {
                    if want_fields {
                        out.push(RespValue::Bulk(f));
                    }
                    if want_values {
                        out.push(RespValue::Bulk(v));
                    }
                }
                RespValue::array(out)
            }
            Err(e) => store_err(e),
        }
    }

    /// HRANDFIELD key [count [WITHVALUES]]
    fn cmd_hrandfield(&self, args: &[RespValue]) -> RespValue {
        if args.is_empty() || args.len() > 3 {
            return wrong_arity("HRANDFIELD");
        }
        let Some(key) = bytes_arg(args, 0) else {
            return RespValue::error("ERR invalid key");
        };

        if args.len() == 1 {
            return match self.engine.command(|db| db.hrandfield(&key, 1, true)) {
                Ok(Some(mut items)) if !items.is_empty() => RespValue::Bulk(items.remove(0).0),
                Ok(_) => RespValue::Null,
                Err(e) => store_err(e),
            };
        }

        let Some(count) = args[1].as_int() else {
            return RespValue::error("ERR value is not an integer or out of range");
        };
        let with_values = match args.get(2).and_then(|a| a.as_str()) {
            None => false,
            Some(s) if s.eq_ignore_ascii_case("withvalues") => true,
            Some(_) => return RespValue::error("ERR syntax error"),
        };
        let unique = count >= 0;
        let wanted = count.unsigned_abs() as usize;

        match self.engine.command(|db| db.hrandfield(&key, wanted, unique)) {
            Ok(None) => RespValue::Array(Vec::new()),
            Ok(Some(items)) => {
                let mut out = Vec::with_capacity(items.len() * 2);
                for (f, v) in items {
                    out.push(RespValue::Bulk(f));
                    if with_values {
                        out.push(RespValue::Bulk(v));
                    }
                }
                RespValue::array(out)
            }
            Err(e) => store_err(e),
        }
    }

    /// HSCAN key cursor [COUNT count]
    fn cmd_hscan(&self, args: &[RespValue]) -> RespValue {
        if args.len() < 2 {
            return wrong_arity("HSCAN");
        }
        let Some(key) = bytes_arg(args, 0) else {
            return RespValue::error("ERR invalid key");
        };
        let Some(cursor) = args[1].as_int().filter(|c| *c >= 0) else {
            return RespValue::error("ERR invalid cursor");
        };
        let mut count = 10usize;
        let mut i = 2;
        while i < args.len() {
            match args[i].as_str().map(str::to_uppercase).as_deref() {
                Some("COUNT") => {
                    let Some(n) = args.get(i + 1).and_then(|a| a.as_int()).filter(|n| *n > 0)
                    else {
                        return RespValue::error("ERR syntax error");
                    };
                    count = n as usize;
                    i += 2;
                }
                _ => return RespValue::error("ERR syntax error"),
            }
        }

        match self.engine.command(|db| db.hscan(&key, cursor as u64, count)) {
            Ok(None) => RespValue::array(vec![
                RespValue::bulk("0"),
                RespValue::Array(Vec::new()),
            ]),
            Ok(Some((next, page))) => {
                let mut items = Vec::with_capacity(page.len() * 2);
                for (f, v) in page {
                    items.push(RespValue::Bulk(f));
                    items.push(RespValue::Bulk(v));
                }
                RespValue::array(vec![
                    RespValue::bulk(next.to_string()),
                    RespValue::array(items),
                ])
            }
            Err(e) => store_err(e),
        }
    }

    // ========================================================================
    // Per-field expiration family
    // ========================================================================

    /// Shared front end of HEXPIRE / HPEXPIRE / HEXPIREAT / HPEXPIREAT.
    /// `absolute` marks the *AT variants whose time argument is already a
    /// unix timestamp.
    fn cmd_hexpire_generic(
        &self,
        cmd: &str,
        args: &[RespValue],
        unit: TtlUnit,
        absolute: bool,
    ) -> RespValue {
        if args.len() < 5 {
            return wrong_arity(cmd);
        }
        let Some(key) = bytes_arg(args, 0) else {
            return RespValue::error("ERR invalid key");
        };

        // The key is resolved before the rest of the arguments, so a
        // missing key answers an empty array even for malformed tails.
        match self.hash_key_state(&key) {
            KeyState::Missing => return RespValue::Array(Vec::new()),
            KeyState::WrongType => return store_err(StoreError::WrongType),
            KeyState::Hash => {}
        }

        let Some(mut expire) = args[1].as_int() else {
            return RespValue::error("ERR value is not an integer or out of range");
        };
        if expire > EXPIRE_TIME_MAX as i64 {
            return expire_time_err(cmd);
        }
        if unit == TtlUnit::Seconds {
            if expire > (EXPIRE_TIME_MAX / 1000) as i64 {
                return expire_time_err(cmd);
            }
            expire = expire.saturating_mul(1000);
        }

        let mut at = 2;
        let cond = match args.get(at).and_then(|a| a.as_str()) {
            Some(s) if s.eq_ignore_ascii_case("nx") => {
                at += 1;
                ExpireSetCond::Nx
            }
            Some(s) if s.eq_ignore_ascii_case("xx") => {
                at += 1;
                ExpireSetCond::Xx
            }
            Some(s) if s.eq_ignore_ascii_case("gt") => {
                at += 1;
                ExpireSetCond::Gt
            }
            Some(s) if s.eq_ignore_ascii_case("lt") => {
                at += 1;
                ExpireSetCond::Lt
            }
            _ => ExpireSetCond::None,
        };

        let fields = match parse_fields_block(args, at) {
            Ok(f) => f,
            Err(reply) => return reply,
        };

        self.engine.command(|db| {
            let base = if absolute { 0 } else { db.now() as i64 };
            if expire > EXPIRE_TIME_MAX as i64 - base {
                return expire_time_err(cmd);
            }
            let deadline = (expire + base).max(0) as u64;

            match db.hash_set_expiry_batch(
                &key,
                deadline,
                cond,
                FieldSetCond::DontCreateReportNoField,
                &fields,
            ) {
                Err(e) => store_err(e),
                Ok(None) => RespValue::Array(Vec::new()),
                Ok(Some(results)) => {
                    if results
                        .iter()
                        .any(|r| matches!(r, SetExRes::Ok | SetExRes::Deleted))
                    {
                        db.propagate_hpexpireat(&key, deadline, &fields);
                    }
                    RespValue::int_array(results.iter().map(|r| r.code()))
                }
            }
        })
    }

    /// Shared front end of HTTL / HPTTL / HEXPIRETIME / HPEXPIRETIME.
    fn cmd_httl_generic(
        &self,
        cmd: &str,
        args: &[RespValue],
        unit: TtlUnit,
        as_timestamp: bool,
    ) -> RespValue {
        if args.len() < 4 {
            return wrong_arity(cmd);
        }
        let Some(key) = bytes_arg(args, 0) else {
            return RespValue::error("ERR invalid key");
        };
        match self.hash_key_state(&key) {
            KeyState::Missing => return RespValue::Array(Vec::new()),
            KeyState::WrongType => return store_err(StoreError::WrongType),
            KeyState::Hash => {}
        }
        let fields = match parse_fields_block(args, 1) {
            Ok(f) => f,
            Err(reply) => return reply,
        };
        match self
            .engine
            .command(|db| db.hash_ttl_batch(&key, &fields, unit, as_timestamp))
        {
            Ok(None) => RespValue::Array(Vec::new()),
            Ok(Some(codes)) => RespValue::int_array(codes),
            Err(e) => store_err(e),
        }
    }

    /// HPERSIST key FIELDS count field [field ...]
    fn cmd_hpersist(&self, args: &[RespValue]) -> RespValue {
        if args.len() < 4 {
            return wrong_arity("HPERSIST");
        }
        let Some(key) = bytes_arg(args, 0) else {
            return RespValue::error("ERR invalid key");
        };
        match self.hash_key_state(&key) {
            KeyState::Missing => return RespValue::Array(Vec::new()),
            KeyState::WrongType => return store_err(StoreError::WrongType),
            KeyState::Hash => {}
        }
        let fields = match parse_fields_block(args, 1) {
            Ok(f) => f,
            Err(reply) => return reply,
        };
        match self.engine.command(|db| db.hash_persist_batch(&key, &fields)) {
            Ok(None) => RespValue::Array(Vec::new()),
            Ok(Some(results)) => RespValue::int_array(results.iter().map(|r| r.code())),
            Err(e) => store_err(e),
        }
    }

    fn hash_key_state(&self, key: &Bytes) -> KeyState {
        self.engine.command(|db| match db.type_of(key) {
            None => KeyState::Missing,
            Some("hash") => KeyState::Hash,
            Some(_) => KeyState::WrongType,
        })
    }

    // ========================================================================
    // Keyspace commands
    // ========================================================================

    /// SET key value
    fn cmd_set(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 2 {
            return wrong_arity("SET");
        }
        let (Some(key), Some(value)) = (bytes_arg(args, 0), bytes_arg(args, 1)) else {
            return RespValue::error("ERR invalid arguments");
        };
        self.engine.command(|db| db.set_str(key.clone(), value));
        RespValue::ok()
    }

    /// GET key
    fn cmd_get(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 1 {
            return wrong_arity("GET");
        }
        let Some(key) = bytes_arg(args, 0) else {
            return RespValue::error("ERR invalid key");
        };
        match self.engine.command(|db| db.get_str(&key)) {
            Ok(Some(v)) => RespValue::bulk(v),
            Ok(None) => RespValue::Null,
            Err(e) => store_err(e),
        }
    }

    /// DEL key [key ...]
    fn cmd_del(&self, args: &[RespValue]) -> RespValue {
        if args.is_empty() {
            return wrong_arity("DEL");
        }
        let Some(keys) = collect_bytes(args) else {
            return RespValue::error("ERR invalid key");
        };
        RespValue::int(self.engine.command(|db| db.del_keys(&keys)) as i64)
    }

    /// EXISTS key [key ...]
    fn cmd_exists(&self, args: &[RespValue]) -> RespValue {
        if args.is_empty() {
            return wrong_arity("EXISTS");
        }
        let Some(keys) = collect_bytes(args) else {
            return RespValue::error("ERR invalid key");
        };
        let count = self
            .engine
            .command(|db| keys.iter().filter(|k| db.exists_key(k)).count());
        RespValue::int(count as i64)
    }

    /// TYPE key
    fn cmd_type(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 1 {
            return wrong_arity("TYPE");
        }
        let Some(key) = bytes_arg(args, 0) else {
            return RespValue::error("ERR invalid key");
        };
        let name = self.engine.command(|db| db.type_of(&key)).unwrap_or("none");
        RespValue::simple(name)
    }

    /// RENAME key newkey
    fn cmd_rename(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 2 {
            return wrong_arity("RENAME");
        }
        let (Some(key), Some(new_key)) = (bytes_arg(args, 0), bytes_arg(args, 1)) else {
            return RespValue::error("ERR invalid arguments");
        };
        match self.engine.command(|db| db.rename(&key, &new_key)) {
            Ok(()) => RespValue::ok(),
            Err(StoreError::NoSuchKey) => RespValue::error("ERR no such key"),
            Err(e) => store_err(e),
        }
    }

    /// COPY key newkey [REPLACE]
    fn cmd_copy(&self, args: &[RespValue]) -> RespValue {
        if args.len() < 2 || args.len() > 3 {
            return wrong_arity("COPY");
        }
        let (Some(key), Some(new_key)) = (bytes_arg(args, 0), bytes_arg(args, 1)) else {
            return RespValue::error("ERR invalid arguments");
        };
        let replace = match args.get(2).and_then(|a| a.as_str()) {
            None => false,
            Some(s) if s.eq_ignore_ascii_case("replace") => true,
            Some(_) => return RespValue::error("ERR syntax error"),
        };
        match self.engine.command(|db| db.copy(&key, &new_key, replace)) {
            Ok(copied) => RespValue::int(copied as i64),
            Err(e) => store_err(e),
        }
    }

    /// OBJECT ENCODING key
    fn cmd_object(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 2 {
            return wrong_arity("OBJECT");
        }
        match args[0].as_str().map(str::to_uppercase).as_deref() {
            Some("ENCODING") => {
                let Some(key) = bytes_arg(args, 1) else {
                    return RespValue::error("ERR invalid key");
                };
                match self.engine.command(|db| db.object_encoding(&key)) {
                    Some(enc) => RespValue::bulk(enc),
                    None => RespValue::error("ERR no such key"),
                }
            }
            _ => RespValue::error("ERR unknown OBJECT subcommand"),
        }
    }

    // ========================================================================
    // Server commands
    // ========================================================================

    fn cmd_ping(&self, args: &[RespValue]) -> RespValue {
        match args.first().and_then(|a| a.as_bytes()) {
            Some(msg) => RespValue::bulk(msg),
            None => RespValue::pong(),
        }
    }

    fn cmd_echo(&self, args: &[RespValue]) -> RespValue {
        match args.first().and_then(|a| a.as_bytes()) {
            Some(msg) if args.len() == 1 => RespValue::bulk(msg),
            _ => wrong_arity("ECHO"),
        }
    }

    fn cmd_dbsize(&self, _args: &[RespValue]) -> RespValue {
        RespValue::int(self.engine.key_count() as i64)
    }

    fn cmd_flushdb(&self, _args: &[RespValue]) -> RespValue {
        self.engine.command(|db| db.flush());
        RespValue::ok()
    }

    fn cmd_info(&self, _args: &[RespValue]) -> RespValue {
        let uptime = self.start_time.elapsed().as_secs();
        let (keys, hfe_indexed, expired, dirty) = self.engine.command(|db| {
            (
                db.key_count(),
                db.hfe_indexed_count(),
                db.expired_fields(),
                db.dirty(),
            )
        });
        let info = format!(
            "# Server\r\n\
             emberkv_version:{}\r\n\
             os:{}\r\n\
             uptime_in_seconds:{uptime}\r\n\
             \r\n\
             # Stats\r\n\
             total_commands_processed:{}\r\n\
             expired_hash_fields:{expired}\r\n\
             dirty:{dirty}\r\n\
             \r\n\
             # Keyspace\r\n\
             db0:keys={keys},hashes_with_field_ttl={hfe_indexed}\r\n",
            crate::VERSION,
            std::env::consts::OS,
            self.engine.commands_processed(),
        );
        RespValue::bulk(info)
    }

    fn cmd_time(&self, _args: &[RespValue]) -> RespValue {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        RespValue::array(vec![
            RespValue::bulk(now.as_secs().to_string()),
            RespValue::bulk(now.subsec_micros().to_string()),
        ])
    }

    /// CONFIG GET parameter | CONFIG SET parameter value
    fn cmd_config(&self, args: &[RespValue]) -> RespValue {
        let Some(sub) = args.first().and_then(|a| a.as_str()).map(str::to_uppercase) else {
            return wrong_arity("CONFIG");
        };
        match sub.as_str() {
            "GET" => {
                let Some(pattern) = args.get(1).and_then(|a| a.as_str()).map(str::to_lowercase)
                else {
                    return wrong_arity("CONFIG GET");
                };
                self.engine.command(|db| {
                    let c = db.config();
                    let all: [(&str, String); 4] = [
                        ("hash-max-listpack-entries", c.hash_max_listpack_entries.to_string()),
                        ("hash-max-listpack-value", c.hash_max_listpack_value.to_string()),
                        (
                            "lazy-expire-disabled",
                            if c.lazy_expire_disabled { "yes" } else { "no" }.to_string(),
                        ),
                        ("active-expire-quota", c.active_expire_quota_per_cycle.to_string()),
                    ];
                    let mut out = Vec::new();
                    for (name, value) in all {
                        if pattern == "*" || pattern == name {
                            out.push(RespValue::bulk(name));
                            out.push(RespValue::bulk(value));
                        }
                    }
                    RespValue::array(out)
                })
            }
            "SET" => {
                let (Some(name), Some(value)) = (
                    args.get(1).and_then(|a| a.as_str()).map(str::to_lowercase),
                    args.get(2).and_then(|a| a.as_str()).map(str::to_string),
                ) else {
                    return wrong_arity("CONFIG SET");
                };
                self.engine.command(|db| {
                    let c = db.config_mut();
                    let applied = match name.as_str() {
                        "hash-max-listpack-entries" => value
                            .parse()
                            .map(|v| c.hash_max_listpack_entries = v)
                            .is_ok(),
                        "hash-max-listpack-value" => {
                            value.parse().map(|v| c.hash_max_listpack_value = v).is_ok()
                        }
                        "lazy-expire-disabled" => match value.as_str() {
                            "yes" => {
                                c.lazy_expire_disabled = true;
                                true
                            }
                            "no" => {
                                c.lazy_expire_disabled = false;
                                true
                            }
                            _ => false,
                        },
                        "active-expire-quota" => value
                            .parse()
                            .map(|v| c.active_expire_quota_per_cycle = v)
                            .is_ok(),
                        _ => {
                            return RespValue::error(format!(
                                "ERR Unknown CONFIG parameter '{name}'"
                            ))
                        }
                    };
                    if applied {
                        RespValue::ok()
                    } else {
                        RespValue::error(format!("ERR Invalid value for CONFIG parameter '{name}'"))
                    }
                })
            }
            other => RespValue::error(format!("ERR unknown CONFIG subcommand '{other}'")),
        }
    }
}

enum KeyState {
    Missing,
    Hash,
    WrongType,
}

// ========================================================================
// Argument helpers
// ========================================================================

fn bytes_arg(args: &[RespValue], i: usize) -> Option<Bytes> {
    args.get(i)?.as_bytes()
}

fn collect_bytes(args: &[RespValue]) -> Option<Vec<Bytes>> {
    args.iter().map(|a| a.as_bytes()).collect()
}

fn wrong_arity(cmd: &str) -> RespValue {
    RespValue::error(format!("ERR wrong number of arguments for '{cmd}' command"))
}

fn expire_time_err(cmd: &str) -> RespValue {
    RespValue::error(format!("ERR invalid expire time in '{cmd}' command"))
}

fn store_err(e: StoreError) -> RespValue {
    match e {
        StoreError::WrongType => RespValue::error(e.to_string()),
        other => RespValue::error(format!("ERR {other}")),
    }
}

/// Parse the `FIELDS count field [field ...]` tail starting at `at`.
fn parse_fields_block(args: &[RespValue], at: usize) -> Result<Vec<Bytes>, RespValue> {
    match args.get(at).and_then(|a| a.as_str()) {
        Some(s) if s.eq_ignore_ascii_case("fields") => {}
        _ => {
            return Err(RespValue::error(
                "ERR Mandatory argument FIELDS is missing or not at the right position",
            ))
        }
    }
    let Some(numfields) = args.get(at + 1).and_then(|a| a.as_int()).filter(|n| *n > 0) else {
        return Err(RespValue::error(
            "ERR Number of fields must be a positive integer",
        ));
    };
    let available = args.len() - (at + 2);
    if numfields as usize > available {
        return Err(RespValue::error(
            "ERR Parameter `numFields` is more than number of arguments",
        ));
    }
    let mut fields = Vec::with_capacity(numfields as usize);
    for i in 0..numfields as usize {
        match bytes_arg(args, at + 2 + i) {
            Some(f) => fields.push(f),
            None => return Err(RespValue::error("ERR invalid field")),
        }
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db::EngineConfig;
    use crate::storage::sink::{RecordingSink, SinkRecord};
    use std::sync::Mutex;

    fn setup() -> (CommandHandler, Arc<StorageEngine>, Arc<Mutex<SinkRecord>>) {
        let sink = RecordingSink::new();
        let record = sink.handle();
        let engine = Arc::new(StorageEngine::with_sink(
            EngineConfig::default(),
            Box::new(sink),
        ));
        engine.command(|db| db.set_time(1000));
        (CommandHandler::new(Arc::clone(&engine)), engine, record)
    }

    fn run(h: &CommandHandler, parts: &[&str]) -> RespValue {
        h.execute(RespValue::array(
            parts.iter().map(|p| RespValue::bulk(p.to_string())).collect(),
        ))
    }

    #[test]
    fn test_hset_hget_roundtrip() {
        let (h, _, _) = setup();
        assert_eq!(run(&h, &["HSET", "k", "f", "v"]), RespValue::int(1));
        assert_eq!(run(&h, &["HSET", "k", "f", "v2", "g", "w"]), RespValue::int(1));
        assert_eq!(run(&h, &["HGET", "k", "f"]), RespValue::bulk("v2"));
        assert_eq!(run(&h, &["HGET", "k", "missing"]), RespValue::Null);
        assert_eq!(run(&h, &["HGET", "missing", "f"]), RespValue::Null);
        assert_eq!(run(&h, &["HLEN", "k"]), RespValue::int(2));

        // HMSET replies +OK, arity must be odd overall.
        assert_eq!(run(&h, &["HMSET", "k", "a", "1"]), RespValue::ok());
        assert!(run(&h, &["HSET", "k", "f"]).is_error());
    }

    #[test]
    fn test_hexpire_flow_and_rewrite_propagation() {
        let (h, engine, record) = setup();
        run(&h, &["HSET", "k", "f", "v"]);

        // 10s at now=1000 → absolute 11000 ms, rewritten for replication.
        assert_eq!(
            run(&h, &["HEXPIRE", "k", "10", "FIELDS", "1", "f"]),
            RespValue::int_array([1])
        );
        {
            let rec = record.lock().unwrap();
            assert_eq!(
                rec.count_command(&[b"HPEXPIREAT", b"k", b"11000", b"FIELDS", b"1", b"f"]),
                1
            );
        }

        let reply = run(&h, &["HTTL", "k", "FIELDS", "1", "f"]);
        assert_eq!(reply, RespValue::int_array([10]));
        assert_eq!(
            run(&h, &["HPTTL", "k", "FIELDS", "1", "f"]),
            RespValue::int_array([10_000])
        );
        assert_eq!(
            run(&h, &["HPEXPIRETIME", "k", "FIELDS", "1", "f"]),
            RespValue::int_array([11_000])
        );
        assert_eq!(
            run(&h, &["HEXPIRETIME", "k", "FIELDS", "1", "f"]),
            RespValue::int_array([11])
        );

        // At the deadline the field reads as gone and HDEL is propagated.
        engine.command(|db| db.set_time(11_000));
        assert_eq!(run(&h, &["HGET", "k", "f"]), RespValue::Null);
        assert!(run(&h, &["EXISTS", "k"]) == RespValue::int(0));
        let rec = record.lock().unwrap();
        assert_eq!(rec.count_command(&[b"HDEL", b"k", b"f"]), 1);
    }

    #[test]
    fn test_hexpire_conditions() {
        let (h, _, _) = setup();
        run(&h, &["HSET", "k", "f", "v"]);
        assert_eq!(
            run(&h, &["HPEXPIREAT", "k", "2000", "FIELDS", "1", "f"]),
            RespValue::int_array([1])
        );
        assert_eq!(
            run(&h, &["HPEXPIREAT", "k", "1500", "GT", "FIELDS", "1", "f"]),
            RespValue::int_array([0])
        );
        assert_eq!(
            run(&h, &["HPEXPIREAT", "k", "1500", "LT", "FIELDS", "1", "f"]),
            RespValue::int_array([1])
        );
        // Condition token is case-insensitive.
        assert_eq!(
            run(&h, &["HPEXPIREAT", "k", "9000", "xx", "FIELDS", "1", "f"]),
            RespValue::int_array([1])
        );
    }

    #[test]
    fn test_hexpire_past_deadline_deletes() {
        let (h, _, record) = setup();
        run(&h, &["HSET", "k", "only", "v"]);
        assert_eq!(
            run(&h, &["HPEXPIREAT", "k", "500", "FIELDS", "1", "only"]),
            RespValue::int_array([2])
        );
        assert_eq!(run(&h, &["EXISTS", "k"]), RespValue::int(0));
        let rec = record.lock().unwrap();
        assert_eq!(rec.count_command(&[b"HDEL", b"k", b"only"]), 1);
        assert_eq!(rec.count_event("del", b"k"), 1);
    }

    #[test]
    fn test_hexpire_argument_validation() {
        let (h, _, _) = setup();
        run(&h, &["HSET", "k", "f", "v"]);

        // Missing key answers an empty array even with a malformed tail.
        assert_eq!(
            run(&h, &["HEXPIRE", "nope", "10", "BOGUS", "1", "f"]),
            RespValue::Array(vec![])
        );

        let e = run(&h, &["HEXPIRE", "k", "10", "NOPE", "1", "f"]);
        assert_eq!(
            e,
            RespValue::error("ERR Mandatory argument FIELDS is missing or not at the right position")
        );

        assert_eq!(
            run(&h, &["HEXPIRE", "k", "10", "FIELDS", "0", "f"]),
            RespValue::error("ERR Number of fields must be a positive integer")
        );
        assert_eq!(
            run(&h, &["HEXPIRE", "k", "10", "FIELDS", "3", "f"]),
            RespValue::error("ERR Parameter `numFields` is more than number of arguments")
        );
        assert_eq!(
            run(&h, &["HEXPIRE", "k", "notanum", "FIELDS", "1", "f"]),
            RespValue::error("ERR value is not an integer or out of range")
        );

        let huge = (EXPIRE_TIME_MAX / 1000 + 1).to_string();
        assert_eq!(
            run(&h, &["HEXPIRE", "k", &huge, "FIELDS", "1", "f"]),
            RespValue::error("ERR invalid expire time in 'hexpire' command")
        );
    }

    #[test]
    fn test_ttl_and_persist_codes() {
        let (h, _, _) = setup();
        run(&h, &["HSET", "k", "ttl", "1", "plain", "2"]);
        run(&h, &["HPEXPIREAT", "k", "50000", "FIELDS", "1", "ttl"]);

        assert_eq!(
            run(&h, &["HTTL", "k", "FIELDS", "3", "ttl", "plain", "nope"]),
            RespValue::int_array([49, -1, -2])
        );
        assert_eq!(
            run(&h, &["HPERSIST", "k", "FIELDS", "3", "ttl", "plain", "nope"]),
            RespValue::int_array([1, -1, -2])
        );
        assert_eq!(
            run(&h, &["HTTL", "k", "FIELDS", "1", "ttl"]),
            RespValue::int_array([-1])
        );
        // Missing key.
        assert_eq!(
            run(&h, &["HTTL", "nope", "FIELDS", "1", "f"]),
            RespValue::Array(vec![])
        );
    }

    #[test]
    fn test_object_encoding_transitions() {
        let (h, _, _) = setup();
        run(&h, &["CONFIG", "SET", "hash-max-listpack-value", "8"]);

        run(&h, &["HSET", "k", "f", "12345678"]);
        assert_eq!(run(&h, &["OBJECT", "ENCODING", "k"]), RespValue::bulk("listpack"));

        run(&h, &["HEXPIRE", "k", "100", "FIELDS", "1", "f"]);
        assert_eq!(run(&h, &["OBJECT", "ENCODING", "k"]), RespValue::bulk("listpackex"));

        run(&h, &["HSET", "k", "f2", "123456789"]);
        assert_eq!(run(&h, &["OBJECT", "ENCODING", "k"]), RespValue::bulk("hashtable"));

        assert_eq!(
            run(&h, &["OBJECT", "ENCODING", "gone"]),
            RespValue::error("ERR no such key")
        );
    }

    #[test]
    fn test_hgetall_skips_expired() {
        let (h, engine, _) = setup();
        run(&h, &["HSET", "k", "a", "1", "b", "2"]);
        run(&h, &["HPEXPIREAT", "k", "1500", "FIELDS", "1", "a"]);
        engine.command(|db| db.set_time(2000));

        assert_eq!(
            run(&h, &["HGETALL", "k"]),
            RespValue::array(vec![RespValue::bulk("b"), RespValue::bulk("2")])
        );
        assert_eq!(run(&h, &["HKEYS", "k"]), RespValue::array(vec![RespValue::bulk("b")]));
        assert_eq!(run(&h, &["HVALS", "k"]), RespValue::array(vec![RespValue::bulk("2")]));
    }

    #[test]
    fn test_hrandfield_shapes() {
        let (h, _, _) = setup();
        run(&h, &["HSET", "k", "a", "1", "b", "2", "c", "3"]);

        assert!(matches!(run(&h, &["HRANDFIELD", "k"]), RespValue::Bulk(_)));
        assert_eq!(run(&h, &["HRANDFIELD", "missing"]), RespValue::Null);

        let RespValue::Array(items) = run(&h, &["HRANDFIELD", "k", "2"]) else {
            panic!()
        };
        assert_eq!(items.len(), 2);

        let RespValue::Array(items) = run(&h, &["HRANDFIELD", "k", "-5"]) else {
            panic!()
        };
        assert_eq!(items.len(), 5);

        let RespValue::Array(items) = run(&h, &["HRANDFIELD", "k", "2", "WITHVALUES"]) else {
            panic!()
        };
        assert_eq!(items.len(), 4);

        assert!(run(&h, &["HRANDFIELD", "k", "2", "JUNK"]).is_error());
    }

    #[test]
    fn test_hscan_pages() {
        let (h, _, _) = setup();
        run(&h, &["HSET", "k", "a", "1", "b", "2", "c", "3"]);

        let RespValue::Array(first) = run(&h, &["HSCAN", "k", "0", "COUNT", "2"]) else {
            panic!()
        };
        let cursor = first[0].as_str().unwrap().to_string();
        assert_ne!(cursor, "0");
        let RespValue::Array(page) = &first[1] else { panic!() };
        assert_eq!(page.len(), 4);

        let RespValue::Array(second) = run(&h, &["HSCAN", "k", &cursor, "COUNT", "2"]) else {
            panic!()
        };
        assert_eq!(second[0], RespValue::bulk("0"));
    }

    #[test]
    fn test_hincrby_and_float() {
        let (h, _, _) = setup();
        assert_eq!(run(&h, &["HINCRBY", "k", "n", "5"]), RespValue::int(5));
        assert_eq!(run(&h, &["HINCRBY", "k", "n", "-2"]), RespValue::int(3));
        assert_eq!(run(&h, &["HINCRBYFLOAT", "k", "x", "1.5"]), RespValue::bulk("1.5"));
        assert!(run(&h, &["HINCRBYFLOAT", "k", "x", "abc"]).is_error());

        run(&h, &["HSET", "k", "s", "notanumber"]);
        assert_eq!(
            run(&h, &["HINCRBY", "k", "s", "1"]),
            RespValue::error("ERR hash value is not an integer")
        );
    }

    #[test]
    fn test_wrongtype_replies() {
        let (h, _, _) = setup();
        run(&h, &["SET", "s", "v"]);
        let expect = RespValue::error(
            "WRONGTYPE Operation against a key holding the wrong kind of value",
        );
        assert_eq!(run(&h, &["HGET", "s", "f"]), expect);
        assert_eq!(run(&h, &["HSET", "s", "f", "v"]), expect);
        assert_eq!(run(&h, &["HTTL", "s", "FIELDS", "1", "f"]), expect);
        assert_eq!(run(&h, &["HEXPIRE", "s", "10", "FIELDS", "1", "f"]), expect);

        run(&h, &["HSET", "hash", "f", "v"]);
        assert_eq!(run(&h, &["GET", "hash"]), expect);
    }

    #[test]
    fn test_keyspace_commands() {
        let (h, _, _) = setup();
        run(&h, &["HSET", "k", "f", "v"]);
        assert_eq!(run(&h, &["TYPE", "k"]), RespValue::simple("hash"));
        assert_eq!(run(&h, &["TYPE", "nope"]), RespValue::simple("none"));

        assert_eq!(run(&h, &["COPY", "k", "k2"]), RespValue::int(1));
        assert_eq!(run(&h, &["HGET", "k2", "f"]), RespValue::bulk("v"));
        assert_eq!(run(&h, &["COPY", "k", "k2"]), RespValue::int(0));
        assert_eq!(run(&h, &["COPY", "k", "k2", "REPLACE"]), RespValue::int(1));

        assert_eq!(run(&h, &["RENAME", "k", "k3"]), RespValue::ok());
        assert_eq!(run(&h, &["RENAME", "k", "k4"]), RespValue::error("ERR no such key"));
        assert_eq!(run(&h, &["EXISTS", "k", "k2", "k3"]), RespValue::int(2));

        assert_eq!(run(&h, &["DEL", "k2", "k3", "nope"]), RespValue::int(2));
        assert_eq!(run(&h, &["DBSIZE"]), RespValue::int(0));
    }

    #[test]
    fn test_config_roundtrip() {
        let (h, _, _) = setup();
        let RespValue::Array(all) = run(&h, &["CONFIG", "GET", "*"]) else { panic!() };
        assert_eq!(all.len(), 8);

        assert_eq!(
            run(&h, &["CONFIG", "SET", "hash-max-listpack-entries", "16"]),
            RespValue::ok()
        );
        assert_eq!(
            run(&h, &["CONFIG", "GET", "hash-max-listpack-entries"]),
            RespValue::array(vec![
                RespValue::bulk("hash-max-listpack-entries"),
                RespValue::bulk("16"),
            ])
        );
        assert_eq!(
            run(&h, &["CONFIG", "SET", "lazy-expire-disabled", "yes"]),
            RespValue::ok()
        );
        assert!(run(&h, &["CONFIG", "SET", "bogus", "1"]).is_error());
    }

    #[test]
    fn test_lazy_expire_disabled_via_config() {
        let (h, engine, record) = setup();
        run(&h, &["HSET", "k", "f", "v"]);
        run(&h, &["HPEXPIREAT", "k", "1500", "FIELDS", "1", "f"]);
        run(&h, &["CONFIG", "SET", "lazy-expire-disabled", "yes"]);

        engine.command(|db| db.set_time(9000));
        assert_eq!(run(&h, &["HGET", "k", "f"]), RespValue::bulk("v"));
        assert_eq!(record.lock().unwrap().count_command(&[b"HDEL", b"k", b"f"]), 0);

        run(&h, &["CONFIG", "SET", "lazy-expire-disabled", "no"]);
        assert_eq!(run(&h, &["HGET", "k", "f"]), RespValue::Null);
    }

    #[test]
    fn test_hmget_after_hash_expires() {
        let (h, engine, _) = setup();
        run(&h, &["HSET", "k", "f", "v"]);
        run(&h, &["HPEXPIREAT", "k", "1500", "FIELDS", "1", "f"]);
        engine.command(|db| db.set_time(2000));

        // The first lookup deletes the hash; the rest answer null.
        assert_eq!(
            run(&h, &["HMGET", "k", "f", "g", "h"]),
            RespValue::array(vec![RespValue::Null, RespValue::Null, RespValue::Null])
        );
    }

    #[test]
    fn test_misc_server_commands() {
        let (h, _, _) = setup();
        assert_eq!(run(&h, &["PING"]), RespValue::pong());
        assert_eq!(run(&h, &["PING", "hey"]), RespValue::bulk("hey"));
        assert_eq!(run(&h, &["ECHO", "x"]), RespValue::bulk("x"));
        assert!(matches!(run(&h, &["INFO"]), RespValue::Bulk(_)));
        assert!(matches!(run(&h, &["TIME"]), RespValue::Array(_)));
        assert!(run(&h, &["NOSUCHCMD"]).is_error());
        assert_eq!(run(&h, &["QUIT"]), RespValue::ok());
    }

    #[test]
    fn test_hsetnx() {
        let (h, _, _) = setup();
        assert_eq!(run(&h, &["HSETNX", "k", "f", "v"]), RespValue::int(1));
        assert_eq!(run(&h, &["HSETNX", "k", "f", "v2"]), RespValue::int(0));
        assert_eq!(run(&h, &["HGET", "k", "f"]), RespValue::bulk("v"));
    }

    #[test]
    fn test_hdel_and_hexists() {
        let (h, _, _) = setup();
        run(&h, &["HSET", "k", "a", "1", "b", "2"]);
        assert_eq!(run(&h, &["HEXISTS", "k", "a"]), RespValue::int(1));
        assert_eq!(run(&h, &["HDEL", "k", "a", "nope"]), RespValue::int(1));
        assert_eq!(run(&h, &["HEXISTS", "k", "a"]), RespValue::int(0));
        assert_eq!(run(&h, &["HSTRLEN", "k", "b"]), RespValue::int(1));
    }
}
