use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use futures::future::join_all;
use once_cell::sync::Lazy;
use redis::aio::MultiplexedConnection;
use regex::Regex;
use thiserror::Error;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

/// Standard port of the store. Is not meant to change.
pub const PORT: u16 = 6379;

/// Minimum desired size of the replication, a simple primary-secondary pair.
/// Kubernetes environments are volatile, so it is better to keep at least 3
/// instances and be free to lose one for whatever reason, especially when
/// there is no permission to use persistent storage.
pub const MINIMUM_FAILOVER_SIZE: usize = 2;

/// Upper bound for the exponential backoff timer used while waiting for a
/// promoted instance to settle.
pub const DEFAULT_FAILOVER_TIMEOUT: Duration = Duration::from_secs(5);

const BACKOFF_INITIAL_DELAY: Duration = Duration::from_millis(100);
const BACKOFF_MAX_DELAY: Duration = Duration::from_secs(1);

// Role markers as seen in the info replication output.
const ROLE_PRIMARY_MARKER: &str = "role:master";
const ROLE_SECONDARY_MARKER: &str = "role:slave";

// primary-side fields
const CONNECTED_SECONDARIES: &str = "connected_slaves";
const PRIMARY_REPL_OFFSET: &str = "master_repl_offset";

// secondary-side fields
const SECONDARY_PRIORITY: &str = "slave_priority";
const SECONDARY_REPL_OFFSET: &str = "slave_repl_offset";
const PRIMARY_HOST: &str = "master_host";
const PRIMARY_PORT: &str = "master_port";
const PRIMARY_LINK_STATUS: &str = "master_link_status";

static INFO_REPLICATION_RE: Lazy<Regex> = Lazy::new(build_info_replication_re);

/// Builds the regexp extracting the known line shapes from an
/// `INFO replication` body. The format is produced by a third-party tool and
/// is stable but not versioned, so everything not matched here is ignored.
fn build_info_replication_re() -> Regex {
    // dotted-quad IPv4 address
    let addr = r"((25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)";

    let mut alternatives = Vec::new();
    for field in [
        CONNECTED_SECONDARIES,
        PRIMARY_REPL_OFFSET,
        SECONDARY_PRIORITY,
        SECONDARY_REPL_OFFSET,
        PRIMARY_PORT,
    ] {
        alternatives.push(format!(r"^{field}:\d+\s*?$"));
    }
    alternatives.push(format!(r"^{PRIMARY_HOST}:{addr}\s*?$"));
    alternatives.push(format!(r"^{PRIMARY_LINK_STATUS}:\w+\s*?$"));
    // the advertised-secondary line is the most complex of all
    alternatives.push(format!(
        r"^slave\d+:ip={addr},port=\d{{1,5}},state=\w+,offset=\d+,lag=\d+\s*?$"
    ));

    Regex::new(&format!("(?m){}", alternatives.join("|"))).unwrap()
}

/// Host:port pair of a store instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: String,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
}

#[derive(Debug, Error)]
#[error("no role marker found in the replication info")]
pub struct ParseError;

/// The subset of the `INFO replication` fields the controller acts on.
/// Role-mismatched fields stay zero-valued, as do fields whose numeric
/// values fail to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationInfo {
    pub role: Role,
    pub replication_offset: u64,

    // primary-side fields
    pub connected_secondaries: u64,
    pub secondaries: Vec<SecondaryRecord>,

    // secondary-side fields
    pub secondary_priority: u64,
    pub primary_host: String,
    pub primary_port: String,
    pub primary_link_status: String,
}

/// A secondary as advertised by its primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryRecord {
    pub address: Address,
    pub replication_offset: u64,
}

impl ReplicationInfo {
    /// Parses an `INFO replication` body. The only fatal condition is a
    /// missing role marker; everything else is best-effort.
    pub fn parse(body: &str) -> Result<Self, ParseError> {
        let role = if body.contains(ROLE_PRIMARY_MARKER) {
            Role::Primary
        } else if body.contains(ROLE_SECONDARY_MARKER) {
            Role::Secondary
        } else {
            return Err(ParseError);
        };

        let mut info = ReplicationInfo {
            role,
            replication_offset: 0,
            connected_secondaries: 0,
            secondaries: Vec::new(),
            secondary_priority: 0,
            primary_host: String::new(),
            primary_port: String::new(),
            primary_link_status: String::new(),
        };

        for found in INFO_REPLICATION_RE.find_iter(body) {
            let line = found.as_str().trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match (role, key) {
                (Role::Primary, CONNECTED_SECONDARIES) => {
                    info.connected_secondaries = parse_number(value)
                }
                (Role::Primary, PRIMARY_REPL_OFFSET) => info.replication_offset = parse_number(value),
                (Role::Primary, key) if key.starts_with("slave") => {
                    info.secondaries.push(parse_secondary_record(value))
                }
                (Role::Secondary, SECONDARY_PRIORITY) => info.secondary_priority = parse_number(value),
                (Role::Secondary, SECONDARY_REPL_OFFSET) => {
                    info.replication_offset = parse_number(value)
                }
                (Role::Secondary, PRIMARY_HOST) => info.primary_host = value.to_string(),
                (Role::Secondary, PRIMARY_PORT) => info.primary_port = value.to_string(),
                (Role::Secondary, PRIMARY_LINK_STATUS) => {
                    info.primary_link_status = value.to_string()
                }
                _ => {}
            }
        }

        Ok(info)
    }
}

fn parse_number(value: &str) -> u64 {
    value.trim().parse().unwrap_or_default()
}

/// Parses the `ip=…,port=…,state=…,offset=…,lag=…` tail of an advertised
/// secondary line.
fn parse_secondary_record(value: &str) -> SecondaryRecord {
    let mut record = SecondaryRecord {
        address: Address {
            host: String::new(),
            port: String::new(),
        },
        replication_offset: 0,
    };
    for field in value.split(',') {
        match field.split_once('=') {
            Some(("ip", ip)) => record.address.host = ip.to_string(),
            Some(("port", port)) => record.address.port = port.to_string(),
            Some(("offset", offset)) => record.replication_offset = parse_number(offset),
            _ => {}
        }
    }
    record
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("parsing replication info from {address} failed: {source}")]
    Parse { address: Address, source: ParseError },
    #[error("connecting to {address} failed: {source}")]
    Connect {
        address: Address,
        source: redis::RedisError,
    },
    #[error("authentication against {address} failed: {source}")]
    Auth {
        address: Address,
        source: redis::RedisError,
    },
    #[error("querying replication info from {address} failed: {source}")]
    TopologyQuery {
        address: Address,
        source: redis::RedisError,
    },
    #[error("reassigning {address} failed: {source}")]
    Reassign {
        address: Address,
        source: redis::RedisError,
    },
    #[error("minimum replication size is not met, only {0} instances are healthy")]
    InsufficientQuorum(usize),
    #[error("timed out waiting for {0} to report itself as primary")]
    PromotionTimeout(Address),
    #[error("primary is lost but no secondary is eligible for promotion")]
    NoCandidates,
    #[error("{0}")]
    Aggregate(String),
}

/// The two wire operations the controller needs from an instance, plus the
/// liveness probe. Connections close when the implementor is dropped.
#[async_trait]
pub(crate) trait Conn: Send {
    async fn ping(&mut self) -> Result<(), redis::RedisError>;
    async fn info_replication(&mut self) -> Result<String, redis::RedisError>;
    async fn replica_of(&mut self, host: &str, port: &str) -> Result<(), redis::RedisError>;
}

struct RedisConn(MultiplexedConnection);

#[async_trait]
impl Conn for RedisConn {
    async fn ping(&mut self) -> Result<(), redis::RedisError> {
        let _: String = redis::cmd("PING").query_async(&mut self.0).await?;
        Ok(())
    }

    async fn info_replication(&mut self) -> Result<String, redis::RedisError> {
        let info: String = redis::cmd("INFO")
            .arg("replication")
            .query_async(&mut self.0)
            .await?;
        Ok(info)
    }

    async fn replica_of(&mut self, host: &str, port: &str) -> Result<(), redis::RedisError> {
        // One transaction: repoint the replication, then disconnect all
        // other normal clients so they re-resolve the primary on reconnect.
        // Both effects must become visible at the same instant. Replies are
        // not inspected; the next INFO query observes the outcome.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SLAVEOF")
            .arg(host)
            .arg(port)
            .ignore()
            .cmd("CLIENT")
            .arg("KILL")
            .arg("TYPE")
            .arg("normal")
            .ignore();
        let _: () = pipe.query_async(&mut self.0).await?;
        Ok(())
    }
}

async fn connect(
    address: &Address,
    password: Option<&str>,
) -> Result<Box<dyn Conn>, ReplicationError> {
    let client = redis::Client::open(redis::ConnectionInfo {
        addr: redis::ConnectionAddr::Tcp(address.host.clone(), address.port.parse().unwrap_or(PORT)),
        redis: redis::RedisConnectionInfo {
            password: password.map(str::to_owned),
            ..Default::default()
        },
    })
    .map_err(|source| ReplicationError::Connect {
        address: address.clone(),
        source,
    })?;

    let conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| classify_connect_error(address, e))?;

    let mut conn = RedisConn(conn);
    conn.ping()
        .await
        .map_err(|e| classify_connect_error(address, e))?;
    Ok(Box::new(conn))
}

fn classify_connect_error(address: &Address, source: redis::RedisError) -> ReplicationError {
    if source.kind() == redis::ErrorKind::AuthenticationFailed {
        ReplicationError::Auth {
            address: address.clone(),
            source,
        }
    } else {
        ReplicationError::Connect {
            address: address.clone(),
            source,
        }
    }
}

/// One live instance: its address, the last parsed replication info and the
/// owned connection.
pub(crate) struct Instance {
    address: Address,
    info: Option<ReplicationInfo>,
    conn: Box<dyn Conn>,
}

impl Instance {
    async fn refresh(&mut self) -> Result<(), ReplicationError> {
        let body = self
            .conn
            .info_replication()
            .await
            .map_err(|source| ReplicationError::TopologyQuery {
                address: self.address.clone(),
                source,
            })?;
        let info = ReplicationInfo::parse(&body).map_err(|source| ReplicationError::Parse {
            address: self.address.clone(),
            source,
        })?;
        self.info = Some(info);
        Ok(())
    }

    /// Changes the replication target on the fly. A missing target promotes
    /// this instance to primary.
    async fn reassign(&mut self, primary: Option<&Address>) -> Result<(), ReplicationError> {
        let (host, port) = match primary {
            Some(address) => (address.host.as_str(), address.port.as_str()),
            None => ("NO", "ONE"),
        };
        self.conn
            .replica_of(host, port)
            .await
            .map_err(|source| ReplicationError::Reassign {
                address: self.address.clone(),
                source,
            })
    }

    fn role(&self) -> Option<Role> {
        self.info.as_ref().map(|info| info.role)
    }

    /// A working primary has at least one secondary connected.
    fn is_working_primary(&self) -> bool {
        matches!(&self.info, Some(info) if info.role == Role::Primary && info.connected_secondaries > 0)
    }

    /// Secondaries with priority zero never take part in an election.
    fn is_promotion_candidate(&self) -> bool {
        matches!(&self.info, Some(info) if info.role == Role::Secondary && info.secondary_priority != 0)
    }
}

/// Candidate ranking for promotion: a lower secondary priority dominates,
/// ties are broken by a higher replication offset.
fn candidate_order(a: &ReplicationInfo, b: &ReplicationInfo) -> Ordering {
    a.secondary_priority
        .cmp(&b.secondary_priority)
        .then(b.replication_offset.cmp(&a.replication_offset))
}

/// The set of live instances of one replicated deployment. Rebuilt from
/// scratch on every reconcile; never persisted.
pub struct Replication {
    instances: Vec<Instance>,
}

impl Replication {
    /// Creates a new replication over the given addresses. Instances are
    /// added on a best-effort basis: out of N addresses, any instance not
    /// answering PING is skipped. Fails when fewer than
    /// [`MINIMUM_FAILOVER_SIZE`] instances remain or when the initial
    /// refresh fails; opened connections are dropped on every failure path.
    pub async fn new(
        password: Option<&str>,
        addresses: &[Address],
    ) -> Result<Self, ReplicationError> {
        let mut instances = Vec::with_capacity(addresses.len());
        for address in addresses {
            match connect(address, password).await {
                Ok(conn) => instances.push(Instance {
                    address: address.clone(),
                    info: None,
                    conn,
                }),
                Err(err) => debug!(%err, "skipping instance"),
            }
        }

        if instances.len() < MINIMUM_FAILOVER_SIZE {
            return Err(ReplicationError::InsufficientQuorum(instances.len()));
        }

        let mut replication = Replication { instances };
        replication.refresh().await?;
        Ok(replication)
    }

    /// Total number of live instances.
    pub fn size(&self) -> usize {
        self.instances.len()
    }

    /// Refreshes the replication info of every instance in parallel. Returns
    /// only when every query has completed; failures are aggregated.
    pub async fn refresh(&mut self) -> Result<(), ReplicationError> {
        let results = join_all(self.instances.iter_mut().map(Instance::refresh)).await;
        aggregate(results)
    }

    /// Address of the current primary, if one can be determined.
    pub fn primary_address(&self) -> Option<Address> {
        self.select_primary()
            .map(|i| self.instances[i].address.clone())
    }

    /// Checks the state of the replication and fixes it if needed. There
    /// should be one primary and all other instances should follow it. A
    /// working primary serves as the source of truth: only the instances it
    /// does not report among its connected secondaries get reconfigured.
    pub async fn reconfigure(&mut self) -> Result<(), ReplicationError> {
        if self.instances.is_empty() {
            return Ok(());
        }

        let primary = match self.select_primary() {
            Some(primary) => primary,
            // the primary is lost, promote a secondary
            None => self.promote_secondary().await?,
        };

        let primary_address = self.instances[primary].address.clone();
        let connected: HashSet<Address> = self.instances[primary]
            .info
            .as_ref()
            .map(|info| info.secondaries.iter().map(|s| s.address.clone()).collect())
            .unwrap_or_default();

        // reassign all orphans simultaneously
        let reassignments = self
            .instances
            .iter_mut()
            .filter(|instance| {
                instance.address != primary_address && !connected.contains(&instance.address)
            })
            .map(|instance| instance.reassign(Some(&primary_address)));
        let results = join_all(reassignments).await;
        aggregate(results)
    }

    /// Drops every held connection.
    pub fn disconnect(self) {}

    /// Chooses a working primary if one is online. `None` with a non-empty
    /// set means the primary is lost: the presence of any viable secondary
    /// is authoritative evidence that a primary existed. A set of standalone
    /// primaries is the initial rollout state, where any of them will do.
    fn select_primary(&self) -> Option<usize> {
        for (i, instance) in self.instances.iter().enumerate() {
            if instance.is_working_primary() {
                return Some(i);
            }
        }

        if self
            .instances
            .iter()
            .any(Instance::is_promotion_candidate)
        {
            return None;
        }

        if !self.instances.is_empty() {
            return Some(0);
        }

        None
    }

    /// Selects the best secondary, promotes it and waits until it reports
    /// itself as primary.
    async fn promote_secondary(&mut self) -> Result<usize, ReplicationError> {
        let mut candidates: Vec<(usize, &ReplicationInfo)> = self
            .instances
            .iter()
            .enumerate()
            .filter_map(|(i, instance)| {
                instance
                    .info
                    .as_ref()
                    .filter(|info| info.role == Role::Secondary && info.secondary_priority != 0)
                    .map(|info| (i, info))
            })
            .collect();
        candidates.sort_by(|(_, a), (_, b)| candidate_order(a, b));

        let Some(&(promoted, _)) = candidates.first() else {
            return Err(ReplicationError::NoCandidates);
        };

        self.instances[promoted].reassign(None).await?;

        let started = Instant::now();
        let mut delay = BACKOFF_INITIAL_DELAY;
        loop {
            match self.instances[promoted].refresh().await {
                Ok(()) if self.instances[promoted].role() == Some(Role::Primary) => {
                    return Ok(promoted)
                }
                Ok(()) => {}
                Err(err) => debug!(%err, "promotion poll failed"),
            }

            if started.elapsed() + delay >= DEFAULT_FAILOVER_TIMEOUT {
                return Err(ReplicationError::PromotionTimeout(
                    self.instances[promoted].address.clone(),
                ));
            }
            sleep(delay).await;
            delay = (delay * 2).min(BACKOFF_MAX_DELAY);
        }
    }
}

/// Folds the outcome of a parallel fan-out into a single result. Every
/// branch has already run to completion by the time this is called.
fn aggregate(results: Vec<Result<(), ReplicationError>>) -> Result<(), ReplicationError> {
    let failures: Vec<String> = results
        .into_iter()
        .filter_map(|result| result.err().map(|err| err.to_string()))
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(ReplicationError::Aggregate(failures.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    const PRIMARY_INFO: &str = "\
# Replication
role:master
connected_slaves:2
slave0:ip=172.18.0.5,port=6379,state=online,offset=47054,lag=1
slave1:ip=172.18.0.4,port=6379,state=online,offset=47040,lag=1
master_replid:d5cb36eacf068fd6ff3a61c1b7c59192a4db6eaa
master_replid2:0000000000000000000000000000000000000000
master_repl_offset:47054
second_repl_offset:-1
repl_backlog_active:1
repl_backlog_size:1048576
repl_backlog_first_byte_offset:1
repl_backlog_histlen:47054";

    const SECONDARY_INFO: &str = "\
# Replication
role:slave
master_host:172.18.0.2
master_port:6379
master_link_status:up
master_last_io_seconds_ago:4
master_sync_in_progress:0
slave_repl_offset:47054
slave_priority:100
slave_read_only:1
connected_slaves:0
master_replid:d5cb36eacf068fd6ff3a61c1b7c59192a4db6eaa
master_replid2:0000000000000000000000000000000000000000
master_repl_offset:47054
second_repl_offset:-1
repl_backlog_active:1
repl_backlog_size:1048576
repl_backlog_first_byte_offset:1
repl_backlog_histlen:47054";

    fn addr(host: &str) -> Address {
        Address {
            host: host.to_string(),
            port: PORT.to_string(),
        }
    }

    /// Entries are (instance host, target host, target port).
    type ReassignLog = Arc<Mutex<Vec<(String, String, String)>>>;

    struct FakeConn {
        host: String,
        info: String,
        /// Body served after this instance is told to become primary.
        promoted_info: Option<String>,
        fail_info: bool,
        log: ReassignLog,
    }

    fn io_error() -> redis::RedisError {
        redis::RedisError::from((redis::ErrorKind::IoError, "injected failure"))
    }

    #[async_trait]
    impl Conn for FakeConn {
        async fn ping(&mut self) -> Result<(), redis::RedisError> {
            Ok(())
        }

        async fn info_replication(&mut self) -> Result<String, redis::RedisError> {
            if self.fail_info {
                return Err(io_error());
            }
            Ok(self.info.clone())
        }

        async fn replica_of(&mut self, host: &str, port: &str) -> Result<(), redis::RedisError> {
            self.log
                .lock()
                .unwrap()
                .push((self.host.clone(), host.to_string(), port.to_string()));
            if host == "NO" {
                if let Some(promoted) = self.promoted_info.take() {
                    self.info = promoted;
                }
            }
            Ok(())
        }
    }

    fn fake_instance(host: &str, body: &str, log: &ReassignLog) -> Instance {
        let info = ReplicationInfo::parse(body).ok();
        Instance {
            address: addr(host),
            info,
            conn: Box::new(FakeConn {
                host: host.to_string(),
                info: body.to_string(),
                promoted_info: None,
                fail_info: false,
                log: Arc::clone(log),
            }),
        }
    }

    fn primary_body(connected: usize, secondaries: &[(&str, u64)]) -> String {
        let mut body = format!("role:master\nconnected_slaves:{connected}\n");
        for (i, (host, offset)) in secondaries.iter().enumerate() {
            body.push_str(&format!(
                "slave{i}:ip={host},port=6379,state=online,offset={offset},lag=0\n"
            ));
        }
        body.push_str("master_repl_offset:47054\n");
        body
    }

    fn secondary_body(priority: u64, offset: u64) -> String {
        format!(
            "role:slave\nmaster_host:10.0.0.10\nmaster_port:6379\n\
             master_link_status:down\nslave_priority:{priority}\nslave_repl_offset:{offset}\n"
        )
    }

    #[test]
    fn regex_extracts_the_known_primary_lines() {
        let got: Vec<&str> = INFO_REPLICATION_RE
            .find_iter(PRIMARY_INFO)
            .map(|m| m.as_str())
            .collect();
        assert_eq!(
            got,
            vec![
                "connected_slaves:2",
                "slave0:ip=172.18.0.5,port=6379,state=online,offset=47054,lag=1",
                "slave1:ip=172.18.0.4,port=6379,state=online,offset=47040,lag=1",
                "master_repl_offset:47054",
            ]
        );
    }

    #[test]
    fn regex_extracts_the_known_secondary_lines() {
        let got: Vec<&str> = INFO_REPLICATION_RE
            .find_iter(SECONDARY_INFO)
            .map(|m| m.as_str())
            .collect();
        assert_eq!(
            got,
            vec![
                "master_host:172.18.0.2",
                "master_port:6379",
                "master_link_status:up",
                "slave_repl_offset:47054",
                "slave_priority:100",
                "connected_slaves:0",
                "master_repl_offset:47054",
            ]
        );
    }

    #[test]
    fn parse_primary_info() {
        let info = ReplicationInfo::parse(PRIMARY_INFO).unwrap();
        assert_eq!(info.role, Role::Primary);
        assert_eq!(info.replication_offset, 47054);
        assert_eq!(info.connected_secondaries, 2);
        assert_eq!(
            info.secondaries,
            vec![
                SecondaryRecord {
                    address: Address {
                        host: "172.18.0.5".to_string(),
                        port: "6379".to_string()
                    },
                    replication_offset: 47054,
                },
                SecondaryRecord {
                    address: Address {
                        host: "172.18.0.4".to_string(),
                        port: "6379".to_string()
                    },
                    replication_offset: 47040,
                },
            ]
        );
        // secondary-side fields stay zero-valued
        assert_eq!(info.secondary_priority, 0);
        assert!(info.primary_host.is_empty());
        assert!(info.primary_link_status.is_empty());
    }

    #[test]
    fn parse_secondary_info() {
        let info = ReplicationInfo::parse(SECONDARY_INFO).unwrap();
        assert_eq!(info.role, Role::Secondary);
        assert_eq!(info.replication_offset, 47054);
        assert_eq!(info.secondary_priority, 100);
        assert_eq!(info.primary_host, "172.18.0.2");
        assert_eq!(info.primary_port, "6379");
        assert_eq!(info.primary_link_status, "up");
        // primary-side fields stay zero-valued
        assert_eq!(info.connected_secondaries, 0);
        assert!(info.secondaries.is_empty());
    }

    #[test]
    fn parse_requires_a_role_marker() {
        assert!(ReplicationInfo::parse("").is_err());
        assert!(ReplicationInfo::parse("role:err").is_err());
    }

    #[test]
    fn parse_leaves_missing_optional_fields_zero_valued() {
        let info = ReplicationInfo::parse("role:slave").unwrap();
        assert_eq!(info.role, Role::Secondary);
        assert_eq!(info.replication_offset, 0);
        assert_eq!(info.secondary_priority, 0);
        assert!(info.primary_host.is_empty());
    }

    #[test]
    fn candidate_order_prefers_lower_priority_then_higher_offset() {
        let a = ReplicationInfo::parse(&secondary_body(10, 0)).unwrap();
        let b = ReplicationInfo::parse(&secondary_body(100, 1212)).unwrap();
        assert_eq!(candidate_order(&a, &b), Ordering::Less);

        let c = ReplicationInfo::parse(&secondary_body(100, 47054)).unwrap();
        let d = ReplicationInfo::parse(&secondary_body(100, 47040)).unwrap();
        assert_eq!(candidate_order(&c, &d), Ordering::Less);
        assert_eq!(candidate_order(&d, &c), Ordering::Greater);
        assert_eq!(candidate_order(&c, &c.clone()), Ordering::Equal);
    }

    #[test]
    fn select_primary_prefers_the_working_primary() {
        let log = ReassignLog::default();
        let replication = Replication {
            instances: vec![
                fake_instance("10.0.0.10", "role:master\nconnected_slaves:0\n", &log),
                fake_instance(
                    "10.0.0.11",
                    &primary_body(2, &[("10.0.0.12", 47054), ("10.0.0.13", 47040)]),
                    &log,
                ),
            ],
        };
        assert_eq!(replication.select_primary(), Some(1));
        assert_eq!(replication.primary_address(), Some(addr("10.0.0.11")));
    }

    #[test]
    fn select_primary_signals_a_lost_primary() {
        let log = ReassignLog::default();
        let replication = Replication {
            instances: vec![
                fake_instance("10.0.0.10", "role:master\nconnected_slaves:0\n", &log),
                fake_instance("10.0.0.11", &secondary_body(100, 47054), &log),
            ],
        };
        assert_eq!(replication.select_primary(), None);
        assert_eq!(replication.primary_address(), None);
    }

    #[test]
    fn select_primary_falls_back_to_the_first_standalone() {
        let log = ReassignLog::default();
        let replication = Replication {
            instances: vec![
                fake_instance("10.0.0.10", "role:master\nconnected_slaves:0\n", &log),
                fake_instance("10.0.0.11", "role:master\nconnected_slaves:0\n", &log),
                fake_instance("10.0.0.12", "role:master\nconnected_slaves:0\n", &log),
            ],
        };
        assert_eq!(replication.select_primary(), Some(0));
    }

    #[test]
    fn select_primary_on_an_empty_set() {
        let replication = Replication { instances: vec![] };
        assert_eq!(replication.select_primary(), None);
        assert_eq!(replication.primary_address(), None);
    }

    #[tokio::test]
    async fn reconfigure_of_an_empty_set_is_a_noop() {
        let mut replication = Replication { instances: vec![] };
        replication.reconfigure().await.unwrap();
    }

    #[tokio::test]
    async fn reconfigure_leaves_a_healthy_replication_alone() {
        let log = ReassignLog::default();
        let mut replication = Replication {
            instances: vec![
                fake_instance(
                    "10.0.0.10",
                    &primary_body(2, &[("10.0.0.11", 47054), ("10.0.0.12", 47040)]),
                    &log,
                ),
                fake_instance("10.0.0.11", &secondary_body(100, 47054), &log),
                fake_instance("10.0.0.12", &secondary_body(100, 47040), &log),
            ],
        };
        replication.reconfigure().await.unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconfigure_reparents_orphans_onto_the_working_primary() {
        let log = ReassignLog::default();
        let mut replication = Replication {
            instances: vec![
                fake_instance("10.0.0.10", &primary_body(1, &[("10.0.0.11", 47054)]), &log),
                fake_instance("10.0.0.11", &secondary_body(100, 47054), &log),
                fake_instance("10.0.0.12", "role:master\nconnected_slaves:0\n", &log),
            ],
        };
        replication.reconfigure().await.unwrap();
        assert_eq!(
            log.lock().unwrap().clone(),
            vec![(
                "10.0.0.12".to_string(),
                "10.0.0.10".to_string(),
                "6379".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn reconfigure_bootstraps_a_fresh_deployment() {
        let log = ReassignLog::default();
        let mut replication = Replication {
            instances: vec![
                fake_instance("10.0.0.10", "role:master\nconnected_slaves:0\n", &log),
                fake_instance("10.0.0.11", "role:master\nconnected_slaves:0\n", &log),
                fake_instance("10.0.0.12", "role:master\nconnected_slaves:0\n", &log),
            ],
        };
        replication.reconfigure().await.unwrap();

        let entries = log.lock().unwrap().clone();
        assert_eq!(entries.len(), 2);
        for (instance, target_host, target_port) in entries {
            assert_ne!(instance, "10.0.0.10");
            assert_eq!(target_host, "10.0.0.10");
            assert_eq!(target_port, "6379");
        }
    }

    #[tokio::test]
    async fn reconfigure_promotes_the_most_caught_up_secondary() {
        let log = ReassignLog::default();
        let mut promoted = fake_instance("10.0.0.11", &secondary_body(100, 47054), &log);
        promoted.conn = Box::new(FakeConn {
            host: "10.0.0.11".to_string(),
            info: secondary_body(100, 47054),
            promoted_info: Some("role:master\nconnected_slaves:0\nmaster_repl_offset:47054\n".to_string()),
            fail_info: false,
            log: Arc::clone(&log),
        });
        let mut replication = Replication {
            instances: vec![
                promoted,
                fake_instance("10.0.0.12", &secondary_body(100, 47040), &log),
            ],
        };
        replication.reconfigure().await.unwrap();

        let entries = log.lock().unwrap().clone();
        assert_eq!(
            entries,
            vec![
                (
                    "10.0.0.11".to_string(),
                    "NO".to_string(),
                    "ONE".to_string()
                ),
                (
                    "10.0.0.12".to_string(),
                    "10.0.0.11".to_string(),
                    "6379".to_string()
                ),
            ]
        );
        assert_eq!(replication.primary_address(), None); // not yet working
        assert_eq!(replication.instances[0].role(), Some(Role::Primary));
    }

    #[tokio::test]
    async fn promotion_skips_priority_zero_despite_a_higher_offset() {
        let log = ReassignLog::default();
        let mut winner = fake_instance("10.0.0.12", &secondary_body(50, 2000), &log);
        winner.conn = Box::new(FakeConn {
            host: "10.0.0.12".to_string(),
            info: secondary_body(50, 2000),
            promoted_info: Some("role:master\nconnected_slaves:0\n".to_string()),
            fail_info: false,
            log: Arc::clone(&log),
        });
        let mut replication = Replication {
            instances: vec![
                fake_instance("10.0.0.10", &secondary_body(0, 9999), &log),
                fake_instance("10.0.0.11", &secondary_body(100, 1000), &log),
                winner,
            ],
        };
        replication.reconfigure().await.unwrap();

        let first = log.lock().unwrap().first().cloned().unwrap();
        assert_eq!(
            first,
            (
                "10.0.0.12".to_string(),
                "NO".to_string(),
                "ONE".to_string()
            )
        );
    }

    #[tokio::test(start_paused = true)]
    async fn promotion_times_out_when_the_secondary_never_settles() {
        let log = ReassignLog::default();
        let mut replication = Replication {
            instances: vec![
                fake_instance("10.0.0.11", &secondary_body(100, 47054), &log),
                fake_instance("10.0.0.12", &secondary_body(100, 47040), &log),
            ],
        };
        let err = replication.reconfigure().await.unwrap_err();
        assert!(matches!(err, ReplicationError::PromotionTimeout(_)));
    }

    #[tokio::test]
    async fn refresh_aggregates_per_instance_failures() {
        let log = ReassignLog::default();
        let mut broken = fake_instance("10.0.0.11", &secondary_body(100, 47054), &log);
        broken.conn = Box::new(FakeConn {
            host: "10.0.0.11".to_string(),
            info: String::new(),
            promoted_info: None,
            fail_info: true,
            log: Arc::clone(&log),
        });
        let mut replication = Replication {
            instances: vec![
                fake_instance("10.0.0.10", PRIMARY_INFO, &log),
                broken,
            ],
        };
        let err = replication.refresh().await.unwrap_err();
        match err {
            ReplicationError::Aggregate(message) => assert!(message.contains("10.0.0.11")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn refresh_fails_on_an_unparseable_body() {
        let log = ReassignLog::default();
        let mut replication = Replication {
            instances: vec![fake_instance("10.0.0.10", "role:err", &log)],
        };
        let err = replication.refresh().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Aggregate(_)));
    }
}
