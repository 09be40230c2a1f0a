//! Store key layout of one job.
//!
//! All keys share the `<task_key>:` prefix:
//!
//! | key                   | type       | owner                |
//! |-----------------------|------------|----------------------|
//! | `rows`                | sorted set | row queue            |
//! | `seen:<worker>`       | set        | row assigner         |
//! | `key:<data key>`      | string     | key mapper (forward) |
//! | `path:<path code>`    | string     | key mapper (reverse) |
//! | `data_lock`           | string     | data lock            |
//! | `user:<session id>`   | hash       | session ledger       |
//! | `responses:<session>` | hash       | session ledger       |

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(task_key: &str) -> Self {
        Self {
            prefix: format!("{task_key}:"),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn rows(&self) -> String {
        format!("{}rows", self.prefix)
    }

    pub fn seen(&self, worker: &str) -> String {
        format!("{}seen:{worker}", self.prefix)
    }

    pub fn seen_prefix(&self) -> String {
        format!("{}seen:", self.prefix)
    }

    pub fn data_key(&self, key: &str) -> String {
        format!("{}key:{key}", self.prefix)
    }

    pub fn data_key_prefix(&self) -> String {
        format!("{}key:", self.prefix)
    }

    pub fn path(&self, path_code: &str) -> String {
        format!("{}path:{path_code}", self.prefix)
    }

    pub fn path_prefix(&self) -> String {
        format!("{}path:", self.prefix)
    }

    pub fn data_lock(&self) -> String {
        format!("{}data_lock", self.prefix)
    }

    pub fn user(&self, id: &str) -> String {
        format!("{}user:{id}", self.prefix)
    }

    pub fn user_prefix(&self) -> String {
        format!("{}user:", self.prefix)
    }

    pub fn responses(&self, id: &str) -> String {
        format!("{}responses:{id}", self.prefix)
    }

    pub fn responses_prefix(&self) -> String {
        format!("{}responses:", self.prefix)
    }
}
