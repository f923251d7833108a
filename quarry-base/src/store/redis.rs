use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::instrument;

use quarry_core::{
    AgentTask, IteratorHandle, Job, JobId, JobStatus, MatchInfo, PluginSpec, StoreError, TaskStore,
};

/// How long one blocking queue wait lasts before the stored plugin-config
/// version is re-checked.
const POP_TIMEOUT_SECS: usize = 2;

/// Flips a `new` job to `processing` and records the datasets this group
/// must search. Jobs already past `new` are left untouched.
static INIT_DATASETS: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local status = redis.call('HGET', KEYS[1], 'status')
        if status == 'new' then
            redis.call('HSET', KEYS[1], 'status', 'processing')
            for i = 1, #ARGV do
                redis.call('SADD', KEYS[2], ARGV[i])
            end
            return 1
        end
        return 0
        "#,
    )
});

/// Marks a group as an active participant of a job. The refcount is bumped
/// only on the first call per (group, job) so enqueue counts balance finish
/// counts.
static MARK_GROUP_ACTIVE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('SADD', KEYS[2], ARGV[1]) == 1 then
            redis.call('HINCRBY', KEYS[1], 'agents_left', 1)
        end
        return redis.call('HGET', KEYS[1], 'agents_left')
        "#,
    )
});

/// Accounts one finished batch: `files_in_progress -= n`,
/// `files_processed += n`, `num_matches += matches`.
static UPDATE_WORK: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        redis.call('HINCRBY', KEYS[1], 'files_in_progress', -ARGV[1])
        redis.call('HINCRBY', KEYS[1], 'files_processed', ARGV[1])
        redis.call('HINCRBY', KEYS[1], 'num_matches', ARGV[2])
        return redis.call('HGET', KEYS[1], 'files_processed')
        "#,
    )
});

/// Appends a match unless the job is already terminal.
static ADD_MATCH: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local status = redis.call('HGET', KEYS[1], 'status')
        if status == 'cancelled' or status == 'failed' or status == 'done' then
            return 0
        end
        redis.call('RPUSH', KEYS[2], ARGV[1])
        return 1
        "#,
    )
});

/// Releases one participation refcount and flips the job to `done` iff no
/// participants remain, everything is processed and the job is still
/// `processing`. The status guard makes concurrent finish observations
/// idempotent.
static FINISH_JOB: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local left = redis.call('HINCRBY', KEYS[1], 'agents_left', -1)
        if left < 0 then
            redis.call('HSET', KEYS[1], 'agents_left', 0)
            left = 0
        end
        if left == 0 then
            local status = redis.call('HGET', KEYS[1], 'status')
            local total = tonumber(redis.call('HGET', KEYS[1], 'total_files') or '0') or 0
            local processed = tonumber(redis.call('HGET', KEYS[1], 'files_processed') or '0') or 0
            if status == 'processing' and processed == total then
                redis.call('HSET', KEYS[1], 'status', 'done')
                return 1
            end
        end
        return 0
        "#,
    )
});

/// Fails a job with a message. Terminal jobs absorb.
static FAIL_JOB: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local status = redis.call('HGET', KEYS[1], 'status')
        if status == 'cancelled' or status == 'failed' or status == 'done' then
            return 0
        end
        redis.call('HSET', KEYS[1], 'status', 'failed', 'error', ARGV[1])
        return 1
        "#,
    )
});

/// Upserts the agent record and publishes a new plugin-config version iff
/// the submitted spec differs from the stored one.
static REGISTER_AGENT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local previous = redis.call('HGET', KEYS[1], 'spec')
        redis.call('HSET', KEYS[1], 'backend', ARGV[1], 'spec', ARGV[2], 'active', ARGV[3])
        if previous ~= ARGV[2] then
            return redis.call('INCR', KEYS[2])
        end
        return tonumber(redis.call('GET', KEYS[2]) or '0') or 0
        "#,
    )
});

fn job_key(id: &JobId) -> String {
    format!("job:{id}")
}

fn matches_key(id: &JobId) -> String {
    format!("job:{id}:matches")
}

fn datasets_key(group: &str, id: &JobId) -> String {
    format!("job:{id}:datasets:{group}")
}

fn groups_key(id: &JobId) -> String {
    format!("job:{id}:groups")
}

fn queue_key(group: &str) -> String {
    format!("group:{group}:tasks")
}

fn plugin_config_key(name: &str) -> String {
    format!("plugin:{name}:config")
}

fn agent_key(group: &str) -> String {
    format!("agent:{group}")
}

const PLUGIN_VERSION_KEY: &str = "plugins:version";
const RELOAD_MARKER_KEY: &str = "plugins:reload";

/// Serialize a plugin spec with sorted keys so equal specs compare equal as
/// strings store-side.
fn canonical_spec(spec: &PluginSpec) -> Result<String, StoreError> {
    let sorted: BTreeMap<&String, &Vec<String>> = spec.iter().collect();
    serde_json::to_string(&sorted).map_err(|e| StoreError::Decode(e.to_string()))
}

/// Shared job/queue store backed by redis.
///
/// Job records are hashes, group queues are lists drained with `BLPOP`,
/// per-group dataset claims are set pops, and every compound mutation runs
/// as a server-side script so concurrent agents always observe consistent
/// state.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to the store at `url`, e.g. `redis://127.0.0.1:6379`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(StoreError::connection)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(StoreError::connection)?;
        Ok(Self { conn })
    }

    async fn push_task(&self, group: &str, task: &AgentTask) -> Result<(), StoreError> {
        let wire = task
            .to_wire()
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(queue_key(group), wire)
            .await
            .map_err(StoreError::connection)
    }

    fn parse_counter(fields: &HashMap<String, String>, name: &str) -> Result<u64, StoreError> {
        match fields.get(name) {
            None => Ok(0),
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| StoreError::Decode(format!("bad {name} counter: {raw:?}"))),
        }
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RedisStore")
    }
}

#[async_trait]
impl TaskStore for RedisStore {
    async fn agent_get_task(&self, group: &str, version: u64) -> Result<AgentTask, StoreError> {
        let queue = queue_key(group);
        loop {
            // The version check and the bounded wait together are what
            // synthesize RELOAD tasks: a stale agent never dequeues work.
            if self.get_plugin_config_version().await? != version {
                return Ok(AgentTask::Reload);
            }
            let mut conn = self.conn.clone();
            let popped: Option<(String, String)> = redis::cmd("BLPOP")
                .arg(&queue)
                .arg(POP_TIMEOUT_SECS)
                .query_async(&mut conn)
                .await
                .map_err(StoreError::connection)?;
            if let Some((_, raw)) = popped {
                return AgentTask::from_wire(&raw)
                    .map_err(|e| StoreError::Decode(format!("bad task payload: {e}")));
            }
        }
    }

    #[instrument(skip(self), err)]
    async fn get_job(&self, id: &JobId) -> Result<Job, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(job_key(id))
            .await
            .map_err(StoreError::connection)?;
        if fields.is_empty() {
            return Err(StoreError::UnknownJob(id.to_string()));
        }

        let status = fields
            .get("status")
            .ok_or_else(|| StoreError::Decode(format!("job {id} has no status")))?;
        let status = JobStatus::from_str(status)
            .map_err(|_| StoreError::Decode(format!("bad job status: {status:?}")))?;

        Ok(Job {
            id: id.clone(),
            status,
            raw_yara: fields.get("raw_yara").cloned().unwrap_or_default(),
            taint: fields.get("taint").filter(|t| !t.is_empty()).cloned(),
            total_files: Self::parse_counter(&fields, "total_files")?,
            files_processed: Self::parse_counter(&fields, "files_processed")?,
            files_in_progress: Self::parse_counter(&fields, "files_in_progress")?,
            num_matches: Self::parse_counter(&fields, "num_matches")?,
            error: fields.get("error").cloned(),
        })
    }

    async fn get_yara_by_job(&self, id: &JobId) -> Result<String, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .hget(job_key(id), "raw_yara")
            .await
            .map_err(StoreError::connection)?;
        raw.ok_or_else(|| StoreError::UnknownJob(id.to_string()))
    }

    #[instrument(skip(self, datasets), err)]
    async fn init_job_datasets(
        &self,
        group: &str,
        id: &JobId,
        datasets: &[String],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = INIT_DATASETS.prepare_invoke();
        invocation.key(job_key(id)).key(datasets_key(group, id));
        for dataset in datasets {
            invocation.arg(dataset);
        }
        let _: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::connection)?;
        Ok(())
    }

    async fn get_next_search_dataset(
        &self,
        group: &str,
        id: &JobId,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.spop(datasets_key(group, id))
            .await
            .map_err(StoreError::connection)
    }

    async fn update_job_files(&self, id: &JobId, count: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hincr::<_, _, _, ()>(job_key(id), "total_files", count)
            .await
            .map_err(StoreError::connection)
    }

    #[instrument(skip(self), err)]
    async fn agent_start_job(
        &self,
        group: &str,
        id: &JobId,
        iterator: &IteratorHandle,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        // Mark the group active before the task becomes poppable, so a
        // finish observation can never run against a zero refcount.
        let _: String = MARK_GROUP_ACTIVE
            .key(job_key(id))
            .key(groups_key(id))
            .arg(group)
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::connection)?;
        self.push_task(
            group,
            &AgentTask::Yara {
                job: id.clone(),
                iterator: iterator.clone(),
            },
        )
        .await
    }

    async fn agent_continue_search(&self, group: &str, id: &JobId) -> Result<(), StoreError> {
        self.push_task(group, &AgentTask::Search { job: id.clone() })
            .await
    }

    async fn job_start_work(&self, id: &JobId, n: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hincr::<_, _, _, ()>(job_key(id), "files_in_progress", n)
            .await
            .map_err(StoreError::connection)
    }

    async fn job_update_work(&self, id: &JobId, n: u64, matches: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = UPDATE_WORK
            .key(job_key(id))
            .arg(n)
            .arg(matches)
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::connection)?;
        Ok(())
    }

    async fn add_match(&self, id: &JobId, info: &MatchInfo) -> Result<(), StoreError> {
        let wire = serde_json::to_string(info).map_err(|e| StoreError::Decode(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: i64 = ADD_MATCH
            .key(job_key(id))
            .key(matches_key(id))
            .arg(wire)
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::connection)?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn agent_finish_job(&self, id: &JobId) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let finished: i64 = FINISH_JOB
            .key(job_key(id))
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::connection)?;
        if finished == 1 {
            tracing::info!(job = %id, "job complete");
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn fail_job(&self, id: &JobId, msg: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = FAIL_JOB
            .key(job_key(id))
            .arg(msg)
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::connection)?;
        Ok(())
    }

    #[instrument(skip(self, spec, active), err)]
    async fn register_active_agent(
        &self,
        group: &str,
        backend_url: &str,
        spec: &PluginSpec,
        active: &[String],
    ) -> Result<(), StoreError> {
        let spec = canonical_spec(spec)?;
        let active = serde_json::to_string(active).map_err(|e| StoreError::Decode(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: i64 = REGISTER_AGENT
            .key(agent_key(group))
            .key(PLUGIN_VERSION_KEY)
            .arg(backend_url)
            .arg(spec)
            .arg(active)
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::connection)?;
        Ok(())
    }

    async fn get_plugin_configuration(
        &self,
        name: &str,
    ) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.hgetall(plugin_config_key(name))
            .await
            .map_err(StoreError::connection)
    }

    async fn get_plugin_config_version(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(PLUGIN_VERSION_KEY)
            .await
            .map_err(StoreError::connection)?;
        match raw {
            None => Ok(0),
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| StoreError::Decode(format!("bad plugin version: {raw:?}"))),
        }
    }

    async fn reload_configuration(&self, version: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(RELOAD_MARKER_KEY, version)
            .await
            .map_err(StoreError::connection)
    }
}
