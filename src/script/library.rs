//! The script sources.
//!
//! Each cached key is a hash with the fields `value`, `lockUntil` and
//! `lockOwner`; the field names and the `LOCKED` sentinel are fixed wire
//! literals shared with every other reader of the store. Scripts read and
//! write nothing else.

use super::CacheScript;

/// Probe one key and, if it is unowned or the lock expired, grant the
/// recompute lock to the caller.
///
/// ARGV: now, new lockUntil, owner. Returns `[value, 'LOCKED']` on grant,
/// `[value, lockUntil]` otherwise.
const GET: &str = r"
local v = redis.call('HGET', KEYS[1], 'value')
local lu = redis.call('HGET', KEYS[1], 'lockUntil')
if lu ~= false and tonumber(lu) < tonumber(ARGV[1]) or lu == false and v == false then
    redis.call('HSET', KEYS[1], 'lockUntil', ARGV[2])
    redis.call('HSET', KEYS[1], 'lockOwner', ARGV[3])
    return { v, 'LOCKED' }
end
return {v, lu}";

/// Install a value and release the lock, but only for the owner that still
/// holds it. A mismatched owner is a silent no-op: the write is discarded.
///
/// ARGV: value, owner, ttl seconds.
const SET: &str = r"
local o = redis.call('HGET', KEYS[1], 'lockOwner')
if o ~= ARGV[2] then
    return
end
redis.call('HSET', KEYS[1], 'value', ARGV[1])
redis.call('HDEL', KEYS[1], 'lockUntil')
redis.call('HDEL', KEYS[1], 'lockOwner')
redis.call('EXPIRE', KEYS[1], ARGV[3])";

/// Tombstone one key: expire the lock into the past, clear the owner, and
/// put a short TTL on the whole hash. No ownership check; any caller may
/// tombstone. The stored value stays visible to weak readers.
///
/// ARGV: delay ttl seconds.
const DELETE: &str = r"
redis.call('HSET', KEYS[1], 'lockUntil', 0)
redis.call('HDEL', KEYS[1], 'lockOwner')
redis.call('EXPIRE', KEYS[1], ARGV[1])";

/// Take the lock for an application-driven update if it is unowned, expired
/// or already ours. Returns `'LOCKED'` on success, the current owner
/// otherwise.
///
/// ARGV: owner, lockUntil.
const LOCK: &str = r"
local lu = redis.call('HGET', KEYS[1], 'lockUntil')
local lo = redis.call('HGET', KEYS[1], 'lockOwner')
if lu == false or tonumber(lu) < tonumber(ARGV[2]) or lo == ARGV[1] then
    redis.call('HSET', KEYS[1], 'lockUntil', ARGV[2])
    redis.call('HSET', KEYS[1], 'lockOwner', ARGV[1])
    return 'LOCKED'
end
return lo";

/// Release a lock we own, leaving tombstone semantics behind so the key is
/// immediately eligible for the next recompute.
///
/// ARGV: owner, ttl seconds.
const UNLOCK: &str = r"
local lo = redis.call('HGET', KEYS[1], 'lockOwner')
if lo == ARGV[1] then
    redis.call('HSET', KEYS[1], 'lockUntil', 0)
    redis.call('HDEL', KEYS[1], 'lockOwner')
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end";

/// N-key variant of the get script; one `[value, state]` pair per key.
const GET_BATCH: &str = r"
local rets = {}
for i, key in ipairs(KEYS)
do
    local v = redis.call('HGET', key, 'value')
    local lu = redis.call('HGET', key, 'lockUntil')
    if lu ~= false and tonumber(lu) < tonumber(ARGV[1]) or lu == false and v == false then
        redis.call('HSET', key, 'lockUntil', ARGV[2])
        redis.call('HSET', key, 'lockOwner', ARGV[3])
        table.insert(rets, { v, 'LOCKED' })
    else
        table.insert(rets, {v, lu})
    end
end
return rets";

/// N-key variant of the set script. Stops at the first ownership mismatch;
/// keys past a displaced lock are left for their new owner.
///
/// ARGV: owner, values..., ttls seconds...
const SET_BATCH: &str = r"
local n = #KEYS
for i, key in ipairs(KEYS)
do
    local o = redis.call('HGET', key, 'lockOwner')
    if o ~= ARGV[1] then
        return
    end
    redis.call('HSET', key, 'value', ARGV[i+1])
    redis.call('HDEL', key, 'lockUntil')
    redis.call('HDEL', key, 'lockOwner')
    redis.call('EXPIRE', key, ARGV[i+1+n])
end";

/// N-key variant of the tombstone script.
const DELETE_BATCH: &str = r"
for i, key in ipairs(KEYS) do
    redis.call('HSET', key, 'lockUntil', 0)
    redis.call('HDEL', key, 'lockOwner')
    redis.call('EXPIRE', key, ARGV[1])
end";

/// The full script set, digested once per client.
#[derive(Debug)]
pub struct ScriptSet {
    pub get: CacheScript,
    pub set: CacheScript,
    pub delete: CacheScript,
    pub lock: CacheScript,
    pub unlock: CacheScript,
    pub get_batch: CacheScript,
    pub set_batch: CacheScript,
    pub delete_batch: CacheScript,
}

impl ScriptSet {
    pub fn new() -> Self {
        Self {
            get: CacheScript::new("get", GET),
            set: CacheScript::new("set", SET),
            delete: CacheScript::new("delete", DELETE),
            lock: CacheScript::new("lock", LOCK),
            unlock: CacheScript::new("unlock", UNLOCK),
            get_batch: CacheScript::new("get-batch", GET_BATCH),
            set_batch: CacheScript::new("set-batch", SET_BATCH),
            delete_batch: CacheScript::new("delete-batch", DELETE_BATCH),
        }
    }
}

impl Default for ScriptSet {
    fn default() -> Self {
        Self::new()
    }
}
