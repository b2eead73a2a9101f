//! Server-side scripts. Each runs as one atomic unit inside Redis.

use redis::Script;

/// KEYS[1] counter; ARGV[1] limit, ARGV[2] ttl in ms.
/// Returns {allowed, count}.
const CHECK_AND_INCREMENT: &str = r#"
local limit = tonumber(ARGV[1])
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= limit then
    return {0, current}
end
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return {1, count}
"#;

/// KEYS[1] sorted set; ARGV[1] now ms, ARGV[2] window ms, ARGV[3] member.
/// Returns the count after recording.
const RECORD_EVENT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
redis.call('ZADD', KEYS[1], now, ARGV[3])
redis.call('PEXPIRE', KEYS[1], window)
return redis.call('ZCARD', KEYS[1])
"#;

/// KEYS[i] sorted sets; ARGV[1] now ms, ARGV[2] member, then
/// ARGV[2i+1] window ms and ARGV[2i+2] limit for each key.
/// Returns {1, 0, count_1, ..., count_n} or {0, i, count, oldest_ms}.
const ADMIT_EVENT: &str = r#"
local now = tonumber(ARGV[1])
for i, key in ipairs(KEYS) do
    local window = tonumber(ARGV[2 * i + 1])
    local limit = tonumber(ARGV[2 * i + 2])
    redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
    local count = redis.call('ZCARD', key)
    if count >= limit then
        local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
        local oldest_ms = now
        if oldest[2] then
            oldest_ms = tonumber(oldest[2])
        end
        return {0, i - 1, count, oldest_ms}
    end
end
local result = {1, 0}
for i, key in ipairs(KEYS) do
    local window = tonumber(ARGV[2 * i + 1])
    redis.call('ZADD', key, now, ARGV[2])
    redis.call('PEXPIRE', key, window)
    result[i + 2] = redis.call('ZCARD', key)
end
return result
"#;

pub(super) struct Scripts {
    pub check_and_increment: Script,
    pub record_event: Script,
    pub admit_event: Script,
}

impl Scripts {
    pub fn load() -> Self {
        Self {
            check_and_increment: Script::new(CHECK_AND_INCREMENT),
            record_event: Script::new(RECORD_EVENT),
            admit_event: Script::new(ADMIT_EVENT),
        }
    }
}
