//! Established-connection counts from `netstat -tn` output.

use std::collections::BTreeMap;

/// Connection counts keyed by `<local port>/tcp`.
pub type ConnectionCounts = BTreeMap<String, u32>;

/// Command run inside a container to sample its TCP connections.
pub const NETSTAT_COMMAND: &str = "netstat -tn";

/// Count `ESTABLISHED` lines by local port.
///
/// The local address is the fourth whitespace-separated field; the port is
/// whatever follows its last `:`, so IPv6 addresses work too.
pub fn parse_netstat(output: &str) -> ConnectionCounts {
    let mut counts = ConnectionCounts::new();
    for line in output.lines() {
        if !line.contains("ESTABLISHED") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(local) = fields.get(3) else {
            continue;
        };
        let Some((_, port)) = local.rsplit_once(':') else {
            continue;
        };
        if port.is_empty() {
            continue;
        }
        *counts.entry(format!("{}/tcp", port)).or_insert(0) += 1;
    }
    counts
}

/// Add `other` into `total`.
pub fn merge(total: &mut ConnectionCounts, other: ConnectionCounts) {
    for (port, count) in other {
        *total.entry(port).or_insert(0) += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Active Internet connections (w/o servers)
Proto Recv-Q Send-Q Local Address           Foreign Address         State
tcp        0      0 172.17.0.2:25565        10.0.0.5:51234          ESTABLISHED
tcp        0      0 172.17.0.2:25565        10.0.0.6:40000          ESTABLISHED
tcp        0      0 172.17.0.2:8080         10.0.0.7:33333          TIME_WAIT
tcp        0      0 172.17.0.2:8080         10.0.0.8:44444          ESTABLISHED
tcp6       0      0 ::ffff:172.17.0.2:9000  ::ffff:10.0.0.9:5555    ESTABLISHED
";

    #[test]
    fn test_counts_established_by_local_port() {
        let counts = parse_netstat(SAMPLE);
        assert_eq!(counts.get("25565/tcp"), Some(&2));
        assert_eq!(counts.get("8080/tcp"), Some(&1));
        assert_eq!(counts.get("9000/tcp"), Some(&1));
        assert_eq!(counts.len(), 3);
    }

    #[test]
    fn test_empty_and_garbage_input() {
        assert!(parse_netstat("").is_empty());
        assert!(parse_netstat("ESTABLISHED\nshort line ESTABLISHED").is_empty());
        assert!(parse_netstat("sh: netstat: not found").is_empty());
    }

    #[test]
    fn test_merge() {
        let mut total = parse_netstat(SAMPLE);
        merge(&mut total, parse_netstat(SAMPLE));
        assert_eq!(total.get("25565/tcp"), Some(&4));
    }
}
