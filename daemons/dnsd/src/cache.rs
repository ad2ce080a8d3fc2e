//! Upstream response cache.
//!
//! Keyed by a 64-bit fingerprint of the lowercased question. Entries are
//! evicted on TTL expiry (the minimum across all RRs in the response) or
//! under byte-budget pressure, oldest-expiry first. A fingerprint collision
//! -- a different question hashing to an occupied slot -- is counted and the
//! new response is NOT inserted, so a hit can never serve the wrong answer.
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    hash::Hasher,
    sync::Mutex,
    time::{Duration, Instant},
};

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use tracing::{debug, trace};
use twox_hash::XxHash64;

use crate::metrics;

/// 64-bit fingerprint of a lowercased question string.
pub fn fingerprint(question: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(question.to_lowercase().as_bytes());
    hasher.finish()
}

/// the question string a message asks, in canonical lowercase form
pub fn question_text(msg: &Message) -> Option<String> {
    let q = msg.queries().first()?;
    Some(format!(
        "{} {} {}",
        q.name().to_ascii().to_lowercase(),
        q.query_class(),
        q.query_type()
    ))
}

#[derive(Debug)]
struct Entry {
    question: String,
    response: Message,
    cached_at: Instant,
    eol: Instant,
    size: usize,
    /// seconds already shaved off the stored TTLs by previous hits
    time_eaten: u64,
}

/// TTL-ordered, size-bounded response cache.
#[derive(Debug)]
pub struct ResponseCache {
    inner: Mutex<Inner>,
    max_bytes: usize,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<u64, Entry>,
    /// expiry order; stale handles are skipped on pop
    eol_heap: BinaryHeap<(Reverse<Instant>, u64)>,
    total_bytes: usize,
}

/// Is this upstream response one we may cache for this request?
pub fn cacheable(req: &Message, resp: &Message) -> bool {
    if resp.header().response_code() != ResponseCode::NoError {
        return false;
    }
    if resp.header().truncated() {
        return false;
    }
    if resp.header().op_code() != OpCode::Query || resp.header().message_type() != MessageType::Response
    {
        return false;
    }
    let (Some(req_q), Some(resp_q)) = (question_text(req), question_text(resp)) else {
        return false;
    };
    if req.queries().len() != 1 || resp.queries().len() != 1 || req_q != resp_q {
        return false;
    }
    // wildcard questions poison a fingerprint keyed cache
    !req_q.contains('*')
}

fn min_ttl(resp: &Message) -> Option<Duration> {
    resp.answers()
        .iter()
        .chain(resp.name_servers())
        .chain(resp.additionals())
        .map(|r| r.ttl())
        .min()
        .map(|ttl| Duration::from_secs(u64::from(ttl)))
}

impl ResponseCache {
    /// cache bounded to `max_bytes` of stored responses
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_bytes,
        }
    }

    /// Insert a response. Ignored when not cacheable, zero-TTL, colliding,
    /// or larger than the whole budget.
    pub fn insert(&self, req: &Message, resp: &Message, wire_size: usize) {
        if !cacheable(req, resp) {
            return;
        }
        let Some(ttl) = min_ttl(resp) else { return };
        if ttl.is_zero() || wire_size > self.max_bytes {
            return;
        }
        let question = question_text(req).expect("cacheable implies one question");
        let key = fingerprint(&question);
        let now = Instant::now();

        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if let Some(existing) = inner.entries.get(&key) {
            if existing.question != question {
                metrics::CACHE_COLLISIONS.inc();
                debug!(%question, other = %existing.question, "fingerprint collision, not caching");
                return;
            }
            // refresh below
            let size = existing.size;
            inner.total_bytes -= size;
            inner.entries.remove(&key);
        }

        // size pressure: evict in expiry order until the new entry fits.
        // heap handles can go stale after a refresh; only honor a handle
        // whose expiry still matches the live entry
        while inner.total_bytes + wire_size > self.max_bytes {
            let Some((Reverse(eol), victim)) = inner.eol_heap.pop() else {
                break;
            };
            let live = inner
                .entries
                .get(&victim)
                .map(|e| e.eol == eol)
                .unwrap_or(false);
            if live {
                if let Some(entry) = inner.entries.remove(&victim) {
                    inner.total_bytes -= entry.size;
                    trace!(question = %entry.question, "evicted under size pressure");
                }
            }
        }

        let eol = now + ttl;
        inner.eol_heap.push((Reverse(eol), key));
        inner.total_bytes += wire_size;
        inner.entries.insert(
            key,
            Entry {
                question,
                response: resp.clone(),
                cached_at: now,
                eol,
                size: wire_size,
                time_eaten: 0,
            },
        );
        metrics::CACHE_SIZE.set(inner.total_bytes as i64);
        metrics::CACHE_ENTRIES.set(inner.entries.len() as i64);
    }

    /// Look up a response for this request. On a hit the stored TTLs are
    /// decremented by the seconds elapsed since they were last served, so a
    /// client always sees monotonically decreasing TTLs; with zero elapsed
    /// time the bytes are identical to the upstream response.
    pub fn lookup(&self, req: &Message) -> Option<Message> {
        metrics::CACHE_LOOKUPS.inc();
        let question = question_text(req)?;
        let key = fingerprint(&question);
        let now = Instant::now();

        let mut inner = self.inner.lock().expect("cache lock poisoned");
        match inner.entries.get(&key) {
            None => return None,
            Some(entry) if entry.question != question => {
                metrics::CACHE_COLLISIONS.inc();
                return None;
            }
            Some(entry) if entry.eol <= now => {
                let entry = inner.entries.remove(&key).expect("checked above");
                inner.total_bytes -= entry.size;
                metrics::CACHE_SIZE.set(inner.total_bytes as i64);
                metrics::CACHE_ENTRIES.set(inner.entries.len() as i64);
                return None;
            }
            Some(_) => {}
        }
        let entry = inner.entries.get_mut(&key).expect("checked above");

        // shave elapsed whole seconds off the stored TTLs
        let elapsed = now.duration_since(entry.cached_at).as_secs();
        let eat = elapsed.saturating_sub(entry.time_eaten);
        if eat > 0 {
            entry.time_eaten += eat;
            let mut answers = entry.response.take_answers();
            for record in &mut answers {
                record.set_ttl(record.ttl().saturating_sub(eat as u32));
            }
            entry.response.insert_answers(answers);
        }

        metrics::CACHE_HITS.inc();
        let mut resp = entry.response.clone();
        resp.set_id(req.id());
        Some(resp)
    }

    /// bytes currently cached
    pub fn size_bytes(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").total_bytes
    }

    /// entries currently cached
    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    /// is the cache empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::{rdata, DNSClass, Name, RData, Record, RecordType};
    use hickory_proto::op::Query;

    fn query(name: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x1111);
        msg.set_op_code(OpCode::Query);
        msg.set_message_type(MessageType::Query);
        let mut q = Query::query(Name::from_ascii(name).unwrap(), RecordType::A);
        q.set_query_class(DNSClass::IN);
        msg.add_query(q);
        msg
    }

    fn answer(req: &Message, ttl: u32, ip: [u8; 4]) -> Message {
        let mut resp = Message::new();
        resp.set_id(req.id());
        resp.set_op_code(OpCode::Query);
        resp.set_message_type(MessageType::Response);
        resp.set_response_code(ResponseCode::NoError);
        resp.add_query(req.queries()[0].clone());
        resp.add_answer(Record::from_rdata(
            req.queries()[0].name().clone(),
            ttl,
            RData::A(rdata::A(ip.into())),
        ));
        resp
    }

    #[test]
    fn zero_elapsed_hit_is_byte_identical() {
        let cache = ResponseCache::new(1 << 20);
        let req = query("example.com.");
        let resp = answer(&req, 300, [93, 184, 216, 34]);
        let wire = resp.to_vec().unwrap();
        cache.insert(&req, &resp, wire.len());

        let hit = cache.lookup(&req).expect("hit");
        assert_eq!(hit.to_vec().unwrap(), wire);
    }

    #[test]
    fn uncacheable_responses_are_refused() {
        let cache = ResponseCache::new(1 << 20);
        let req = query("example.com.");

        // NXDOMAIN
        let mut nx = answer(&req, 300, [1, 2, 3, 4]);
        nx.set_response_code(ResponseCode::NXDomain);
        cache.insert(&req, &nx, 64);
        assert!(cache.is_empty());

        // truncated
        let mut tc = answer(&req, 300, [1, 2, 3, 4]);
        tc.set_truncated(true);
        cache.insert(&req, &tc, 64);
        assert!(cache.is_empty());

        // wildcard question
        let wild = query("*.example.com.");
        let wild_resp = answer(&wild, 300, [1, 2, 3, 4]);
        cache.insert(&wild, &wild_resp, 64);
        assert!(cache.is_empty());
    }

    #[test]
    fn size_pressure_evicts_in_expiry_order() {
        let cache = ResponseCache::new(300);
        let short = query("short.example.");
        let long = query("long.example.");
        cache.insert(&short, &answer(&short, 10, [1, 1, 1, 1]), 150);
        cache.insert(&long, &answer(&long, 9000, [2, 2, 2, 2]), 150);
        assert_eq!(cache.len(), 2);

        // a third entry forces out the earliest-expiring one
        let third = query("third.example.");
        cache.insert(&third, &answer(&third, 5000, [3, 3, 3, 3]), 150);
        assert!(cache.lookup(&short).is_none());
        assert!(cache.lookup(&long).is_some());
        assert!(cache.lookup(&third).is_some());
        assert!(cache.size_bytes() <= 300);
    }

    #[test]
    fn question_text_is_case_insensitive_in_the_key() {
        let lower = question_text(&query("example.com.")).unwrap();
        let upper = question_text(&query("EXAMPLE.COM.")).unwrap();
        assert_eq!(fingerprint(&lower), fingerprint(&upper));
    }
}
