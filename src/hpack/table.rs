//! HPACK indexing tables (RFC 7541 Sections 2.3 and 4).
//!
//! One [`HPackTable`] instance per direction: the encoder and decoder each
//! own their table, and decode-side mutations must happen in frame-arrival
//! order (the compression context is connection-wide state).

use std::collections::{HashMap, VecDeque};

/// Number of entries in the static table.
pub const STATIC_TABLE_SIZE: usize = 61;

/// First dynamic-table index (static entries occupy 1..=61).
pub const DYNAMIC_START_INDEX: usize = 62;

/// Per-entry size overhead (RFC 7541 Section 4.1).
const ENTRY_SIZE_EXTRA: usize = 32;

/// HPACK static table (RFC 7541 Appendix A), indexed 1..=61.
pub static STATIC_TABLE: [(&str, &str); STATIC_TABLE_SIZE] = [
    (":authority", ""),                  // 1
    (":method", "GET"),                  // 2
    (":method", "POST"),                 // 3
    (":path", "/"),                      // 4
    (":path", "/index.html"),            // 5
    (":scheme", "http"),                 // 6
    (":scheme", "https"),                // 7
    (":status", "200"),                  // 8
    (":status", "204"),                  // 9
    (":status", "206"),                  // 10
    (":status", "304"),                  // 11
    (":status", "400"),                  // 12
    (":status", "404"),                  // 13
    (":status", "500"),                  // 14
    ("accept-charset", ""),              // 15
    ("accept-encoding", "gzip, deflate"), // 16
    ("accept-language", ""),             // 17
    ("accept-ranges", ""),               // 18
    ("accept", ""),                      // 19
    ("access-control-allow-origin", ""), // 20
    ("age", ""),                         // 21
    ("allow", ""),                       // 22
    ("authorization", ""),               // 23
    ("cache-control", ""),               // 24
    ("content-disposition", ""),         // 25
    ("content-encoding", ""),            // 26
    ("content-language", ""),            // 27
    ("content-length", ""),              // 28
    ("content-location", ""),            // 29
    ("content-range", ""),               // 30
    ("content-type", ""),                // 31
    ("cookie", ""),                      // 32
    ("date", ""),                        // 33
    ("etag", ""),                        // 34
    ("expect", ""),                      // 35
    ("expires", ""),                     // 36
    ("from", ""),                        // 37
    ("host", ""),                        // 38
    ("if-match", ""),                    // 39
    ("if-modified-since", ""),           // 40
    ("if-none-match", ""),               // 41
    ("if-range", ""),                    // 42
    ("if-unmodified-since", ""),         // 43
    ("last-modified", ""),               // 44
    ("link", ""),                        // 45
    ("location", ""),                    // 46
    ("max-forwards", ""),                // 47
    ("proxy-authenticate", ""),          // 48
    ("proxy-authorization", ""),         // 49
    ("range", ""),                       // 50
    ("referer", ""),                     // 51
    ("refresh", ""),                     // 52
    ("retry-after", ""),                 // 53
    ("server", ""),                      // 54
    ("set-cookie", ""),                  // 55
    ("strict-transport-security", ""),   // 56
    ("transfer-encoding", ""),           // 57
    ("user-agent", ""),                  // 58
    ("vary", ""),                        // 59
    ("via", ""),                         // 60
    ("www-authenticate", ""),            // 61
];

fn entry_size(name: &str, value: &str) -> usize {
    name.len() + value.len() + ENTRY_SIZE_EXTRA
}

/// Reverse name index entry on the encoder side: the insertion sequence
/// number of the newest dynamic entry with this name, and the lowest static
/// index with this name.
#[derive(Debug, Clone, Copy, Default)]
struct IndexEntry {
    dyn_seq: Option<u64>,
    static_idx: Option<usize>,
}

/// Shared compression index: static table plus bounded dynamic table.
///
/// `limit_size` is the currently effective size bound (it can sit below the
/// negotiated `max_size` while a size-update is pending); lowering either
/// triggers eviction from the oldest end.
pub struct HPackTable {
    dynamic_table: VecDeque<(String, String)>,
    table_size: usize,
    limit_size: usize,
    max_size: usize,
    /// Encoder instances maintain the reverse name index; decoders skip it.
    is_encoder: bool,
    index_sequence: u64,
    index_map: HashMap<String, IndexEntry>,
}

impl HPackTable {
    /// Create a table. Encoder instances maintain a reverse name->index map
    /// for O(1) match lookup during encoding; decoders need no such map.
    pub fn new(is_encoder: bool) -> Self {
        let mut index_map = HashMap::new();
        if is_encoder {
            for (i, (name, _)) in STATIC_TABLE.iter().enumerate() {
                index_map
                    .entry(name.to_string())
                    .or_insert(IndexEntry {
                        dyn_seq: None,
                        static_idx: Some(i),
                    });
            }
        }
        HPackTable {
            dynamic_table: VecDeque::new(),
            table_size: 0,
            limit_size: 4096,
            max_size: 4096,
            is_encoder,
            index_sequence: 0,
            index_map,
        }
    }

    /// Look up the name at a 1-based HPACK index.
    pub fn get_indexed_name(&self, index: usize) -> Option<&str> {
        if index == 0 {
            return None;
        }
        if index < DYNAMIC_START_INDEX {
            Some(STATIC_TABLE[index - 1].0)
        } else {
            self.dynamic_table
                .get(index - DYNAMIC_START_INDEX)
                .map(|(name, _)| name.as_str())
        }
    }

    /// Look up the value at a 1-based HPACK index.
    pub fn get_indexed_value(&self, index: usize) -> Option<&str> {
        if index == 0 {
            return None;
        }
        if index < DYNAMIC_START_INDEX {
            Some(STATIC_TABLE[index - 1].1)
        } else {
            self.dynamic_table
                .get(index - DYNAMIC_START_INDEX)
                .map(|(_, value)| value.as_str())
        }
    }

    /// Insert a header at the head of the dynamic table, evicting from the
    /// tail as needed. An entry larger than the limit empties the table and
    /// is not inserted - that is not an error (RFC 7541 Section 4.4).
    pub fn add_header(&mut self, name: &str, value: &str) -> bool {
        let size = entry_size(name, value);
        if size + self.table_size > self.limit_size {
            self.evict_by_size(size + self.table_size - self.limit_size);
        }
        if size > self.limit_size {
            return false;
        }
        self.dynamic_table
            .push_front((name.to_string(), value.to_string()));
        self.table_size += size;
        if self.is_encoder {
            self.index_sequence += 1;
            let seq = self.index_sequence;
            self.index_map
                .entry(name.to_string())
                .and_modify(|e| e.dyn_seq = Some(seq))
                .or_insert(IndexEntry {
                    dyn_seq: Some(seq),
                    static_idx: None,
                });
        }
        true
    }

    /// Apply the negotiated maximum from SETTINGS. Lowering drags the
    /// effective limit down immediately.
    pub fn set_max_size(&mut self, size: usize) {
        self.max_size = size;
        if self.limit_size > self.max_size {
            self.update_limit_size(self.max_size);
        }
    }

    /// Apply a dynamic-table size update from the header block. The caller
    /// must have verified `size <= max_size`.
    pub fn update_limit_size(&mut self, size: usize) {
        if self.table_size > size {
            self.evict_by_size(self.table_size - size);
        }
        self.limit_size = size;
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn limit_size(&self) -> usize {
        self.limit_size
    }

    pub fn table_size(&self) -> usize {
        self.table_size
    }

    pub fn len(&self) -> usize {
        self.dynamic_table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dynamic_table.is_empty()
    }

    fn evict_by_size(&mut self, size: usize) {
        let mut evicted = 0;
        while evicted < size {
            let Some((name, value)) = self.dynamic_table.pop_back() else {
                break;
            };
            let entry = entry_size(&name, &value);
            self.table_size = self.table_size.saturating_sub(entry);
            if self.is_encoder {
                self.remove_index(&name, self.dynamic_table.len());
            }
            evicted += entry;
        }
    }

    /// Drop the reverse-map entry if it pointed at the entry that was just
    /// evicted (the map only tracks the newest occurrence of each name).
    fn remove_index(&mut self, name: &str, evicted_pos: usize) {
        let Some(entry) = self.index_map.get_mut(name) else {
            return;
        };
        let Some(seq) = entry.dyn_seq else {
            return;
        };
        if (self.index_sequence - seq) as usize == evicted_pos {
            if entry.static_idx.is_none() {
                self.index_map.remove(name);
            } else {
                entry.dyn_seq = None;
            }
        }
    }

    /// Find the best index for a header on the encode path.
    ///
    /// Returns `(index, value_indexed)`: the 1-based HPACK index of an entry
    /// with a matching name, and whether its value matches too. Prefers the
    /// dynamic table (newest entry) over the static table.
    pub fn get_index(&self, name: &str, value: &str) -> (Option<usize>, bool) {
        let Some(entry) = self.index_map.get(name) else {
            return (None, false);
        };
        if let Some(seq) = entry.dyn_seq {
            let pos = (self.index_sequence - seq) as usize;
            if let Some((n, v)) = self.dynamic_table.get(pos) {
                if n == name {
                    return (Some(pos + DYNAMIC_START_INDEX), v == value);
                }
            }
        }
        if let Some(static_idx) = entry.static_idx {
            let (n, v) = STATIC_TABLE[static_idx];
            if n == name {
                return (Some(static_idx + 1), v == value);
            }
        }
        (None, false)
    }
}
