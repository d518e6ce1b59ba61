//! UUB plug-order detection, grounded on `Evaluator.orderUUB` in
//! `original_source/evaluator.py`: switch relays off one at a time and
//! observe which UUB drops off the network each step.

use std::collections::HashSet;
use std::sync::Arc;

use ess_contracts::power_control::PowerControlDriver;
use ess_model::error::{EssError, Result};
use tokio::sync::Mutex;
use tokio::time::Duration;

/// Timeout between successive relay switches, matching `Evaluator.TOUT_ORD`.
const TOUT_ORD: Duration = Duration::from_millis(500);
/// Expected maximum number of simultaneously live UUBs, matching the
/// source's `range(9, -1, -1)`.
const MAX_LIVE: u32 = 10;

fn uubnum_to_ip(uubnum: u32) -> String {
    format!("192.168.{}.{}", 31 + (uubnum >> 8), uubnum & 0xFF)
}

async fn is_live(client: &reqwest::Client, ip: &str) -> bool {
    let url = format!("http://{ip}:8080/cgi-bin/getdata.cgi?action=xadc");
    client
        .get(&url)
        .timeout(Duration::from_millis(300))
        .send()
        .await
        .is_ok()
}

async fn live_set(client: &reqwest::Client, all: &HashSet<u32>, ip_of: &std::collections::HashMap<u32, String>) -> HashSet<u32> {
    let mut live = HashSet::new();
    for uubnum in all {
        if is_live(client, &ip_of[uubnum]).await {
            live.insert(*uubnum);
        }
    }
    live
}

/// Determines connection order by switching relays off from the highest
/// port down, recording which UUB disappears at each step. Returns a
/// vector the same length as `uubnums`, in slot order, matching the
/// source's `uubnums` accumulator.
pub async fn order_uub<P: PowerControlDriver>(uubnums: &[Option<u32>], pc: Arc<Mutex<P>>) -> Result<Vec<Option<u32>>> {
    let all: HashSet<u32> = uubnums.iter().filter_map(|u| *u).collect();
    let ip_of: std::collections::HashMap<u32, String> = all.iter().map(|u| (*u, uubnum_to_ip(*u))).collect();
    let client = reqwest::Client::new();

    let mut exp = live_set(&client, &all, &ip_of).await;
    let mut detected = Vec::new();
    let mut portmask: u16 = 1;

    for n in (0..MAX_LIVE).rev() {
        {
            let mut pc = pc.lock().await;
            pc.switch_raw(false, portmask).await?;
        }
        portmask <<= 1;
        tokio::time::sleep(TOUT_ORD).await;

        let real = live_set(&client, &all, &ip_of).await;
        if real.len() as u32 > n {
            return Err(EssError::Invariant(format!("too many UUBs still live: {} > {n}", real.len())));
        }
        if !real.is_subset(&exp) {
            return Err(EssError::Invariant("UUB reincarnation: a switched-off UUB reappeared live".to_string()));
        }
        let dropped: Vec<u32> = exp.difference(&real).copied().collect();
        if dropped.len() > 1 {
            return Err(EssError::Invariant(format!("more than one UUB died in a single step: {dropped:?}")));
        }
        detected.push(dropped.first().copied());
        exp = real;
    }

    Ok(detected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_scheme_matches_uub_worker_derivation() {
        assert_eq!(uubnum_to_ip(12), "192.168.31.12");
        assert_eq!(uubnum_to_ip(300), "192.168.32.44");
    }
}
