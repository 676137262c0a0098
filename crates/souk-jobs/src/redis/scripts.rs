//! Lua scripts. Each runs atomically on the Redis server.

/// Delete KEYS[1] if it holds ARGV[1].
pub const COMPARE_AND_DELETE: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Reset the TTL of KEYS[1] to ARGV[2] ms if it holds ARGV[1].
pub const COMPARE_AND_PEXPIRE: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Replace KEYS[1] with ARGV[2] if it holds ARGV[1], keeping its TTL.
pub const COMPARE_AND_SWAP: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    redis.call("set", KEYS[1], ARGV[2], "KEEPTTL")
    return 1
else
    return 0
end
"#;

/// Insert a pending job.
///
/// KEYS: job, pending tier, queue set, completed index, failed index, [dedupe]
/// ARGV: id, json, score, queue name, job key prefix
/// Returns {1, id} when inserted, {0, owner id} for a live duplicate.
pub const INSERT_JOB: &str = r#"
local function live(raw)
    if not raw then
        return false
    end
    local state = cjson.decode(raw)["state"]
    return state ~= "completed" and state ~= "failed"
end

if live(redis.call("get", KEYS[1])) then
    return {0, ARGV[1]}
end

if #KEYS >= 6 then
    local owner = redis.call("get", KEYS[6])
    if owner and live(redis.call("get", ARGV[5] .. owner)) then
        return {0, owner}
    end
    redis.call("set", KEYS[6], ARGV[1])
end

redis.call("zrem", KEYS[4], ARGV[1])
redis.call("zrem", KEYS[5], ARGV[1])
redis.call("set", KEYS[1], ARGV[2])
redis.call("zadd", KEYS[2], ARGV[3], ARGV[1])
redis.call("sadd", KEYS[3], ARGV[4])
return {1, ARGV[1]}
"#;

/// Pop the earliest due job from the highest non-empty priority tier into
/// the active index.
///
/// KEYS: pending tiers (most urgent first), active index
/// ARGV: now in ms
pub const CLAIM_JOB: &str = r#"
local active = KEYS[#KEYS]
for i = 1, #KEYS - 1 do
    local ids = redis.call("zrangebyscore", KEYS[i], "-inf", ARGV[1], "LIMIT", 0, 1)
    if #ids > 0 then
        redis.call("zrem", KEYS[i], ids[1])
        redis.call("zadd", active, ARGV[1], ids[1])
        return ids[1]
    end
end
return false
"#;

/// Remove a job only while it is pending.
///
/// KEYS: job, pending tiers
/// ARGV: id
/// Returns {0, ""} unknown, {1, json} removed, {2, json} not pending.
pub const CANCEL_JOB: &str = r#"
local raw = redis.call("get", KEYS[1])
if not raw then
    return {0, ""}
end
local removed = 0
for i = 2, #KEYS do
    removed = removed + redis.call("zrem", KEYS[i], ARGV[1])
end
if removed > 0 then
    redis.call("del", KEYS[1])
    return {1, raw}
end
return {2, raw}
"#;

/// Trim an index to ARGV[1] members, deleting the evicted job records.
///
/// KEYS: index
/// ARGV: keep, job key prefix
pub const TRIM_INDEX: &str = r#"
local excess = redis.call("zcard", KEYS[1]) - tonumber(ARGV[1])
if excess <= 0 then
    return 0
end
local ids = redis.call("zrange", KEYS[1], 0, excess - 1)
for _, id in ipairs(ids) do
    redis.call("del", ARGV[2] .. id)
end
redis.call("zremrangebyrank", KEYS[1], 0, excess - 1)
return excess
"#;
