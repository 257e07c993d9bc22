use anyhow::{bail, Result};
use tracing::debug;

use crate::namespace::Scope;
use crate::options::IntfParams;

/// Applies egress shaping to `interface` using `tc netem`.
///
/// Removes any existing root qdisc first, then installs netem with the
/// interface's rate, delay, loss and queue limit. Empty params only clear.
pub fn apply_shaping(scope: Scope<'_>, interface: &str, params: &IntfParams) -> Result<()> {
    // best effort: there may be nothing to delete
    let _ = scope.exec("tc", &["qdisc", "del", "dev", interface, "root"]);

    if params.is_empty() {
        return Ok(());
    }

    let args_storage = netem_args(interface, params);
    let args: Vec<&str> = args_storage.iter().map(|s| s.as_str()).collect();
    let output = scope.exec("tc", &args)?;
    if !output.status.success() {
        bail!(
            "failed to apply tc netem: {}\ncommand: tc {}",
            String::from_utf8_lossy(&output.stderr).trim(),
            args.join(" ")
        );
    }
    debug!(interface, ?params, "applied netem");
    Ok(())
}

/// Builds `qdisc add dev <iface> root netem [limit N] [delay] [loss] [rate]`.
pub fn netem_args(interface: &str, params: &IntfParams) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "qdisc".into(),
        "add".into(),
        "dev".into(),
        interface.into(),
        "root".into(),
        "netem".into(),
    ];

    if let Some(limit) = params.max_queue_size {
        args.push("limit".into());
        args.push(limit.to_string());
    }

    if let Some(delay) = params.delay_ms {
        args.push("delay".into());
        args.push(format!("{delay}ms"));
    }

    if let Some(loss) = params.loss_percent {
        args.push("loss".into());
        args.push(format!("{loss}%"));
    }

    if let Some(bw) = params.bw_mbit {
        args.push("rate".into());
        args.push(format!("{}kbit", mbit_to_kbit(bw)));
    }

    args
}

fn mbit_to_kbit(mbit: f64) -> u64 {
    (mbit * 1000.0).round().max(1.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;
    use crate::test_util::{check_privileges, unique_ns_name};

    #[test]
    fn netem_args_cover_every_field_in_order() {
        let params = IntfParams {
            bw_mbit: Some(3.5),
            delay_ms: Some(30),
            loss_percent: Some(1.0),
            max_queue_size: Some(20),
        };
        assert_eq!(
            netem_args("s2-0-eth1", &params).join(" "),
            "qdisc add dev s2-0-eth1 root netem limit 20 delay 30ms loss 1% rate 3500kbit"
        );
    }

    #[test]
    fn netem_args_skip_unset_fields() {
        let params = IntfParams::bandwidth(1000.0);
        assert_eq!(
            netem_args("client-eth0", &params).join(" "),
            "qdisc add dev client-eth0 root netem rate 1000000kbit"
        );
    }

    #[test]
    fn fractional_rates_round_to_whole_kbit() {
        assert_eq!(mbit_to_kbit(1.5), 1500);
        assert_eq!(mbit_to_kbit(0.0001), 1);
    }

    #[test]
    fn test_apply_shaping_on_loopback() {
        if !check_privileges() {
            eprintln!("Skipping test_apply_shaping_on_loopback, insufficient privileges");
            return;
        }

        let ns = Namespace::new(&unique_ns_name("mpd_shp")).expect("create ns");
        let params = IntfParams::default().with_delay(50);
        if let Err(err) = apply_shaping(Scope::Netns(&ns), "lo", &params) {
            if err.to_string().contains("qdisc kind is unknown") {
                eprintln!("Skipping test_apply_shaping_on_loopback, netem qdisc not available");
                return;
            }
            panic!("Failed to apply shaping: {err}");
        }

        let out = ns.exec("tc", &["qdisc", "show", "dev", "lo"]).expect("tc show");
        let stdout = String::from_utf8_lossy(&out.stdout);
        assert!(stdout.contains("netem"), "netem missing: {stdout}");
        assert!(stdout.contains("delay 50"), "delay missing: {stdout}");
    }
}
