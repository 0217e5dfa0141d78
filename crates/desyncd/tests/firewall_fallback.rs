//! Firewall install/remove behavior, exercised as an integration test
//! against a substituted `CommandRunner` rather than a real `iptables`.

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};

use desyncd::firewall::{FirewallManager, IptablesFirewall};

fn recorded_runner() -> (Arc<Mutex<Vec<Vec<String>>>>, impl Fn(&[&str]) -> std::io::Result<Output>) {
    let calls: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let calls_for_closure = calls.clone();
    let runner = move |args: &[&str]| {
        calls_for_closure.lock().unwrap().push(args.iter().map(|s| s.to_string()).collect());
        let rejects_bypass = args.contains(&"--queue-bypass");
        let code = if rejects_bypass { 2 } else { 0 };
        Ok(Output { status: ExitStatus::from_raw(code), stdout: Vec::new(), stderr: Vec::new() })
    };
    (calls, runner)
}

#[test]
fn install_retries_without_queue_bypass_when_the_flag_is_rejected() {
    let (calls, runner) = recorded_runner();
    let mut fw = IptablesFirewall::with_runner(Box::new(runner));

    fw.install(0, 0x10DEAD, &[80, 443]).expect("install should succeed via fallback");

    let calls = calls.lock().unwrap();
    let install_attempts: Vec<&Vec<String>> =
        calls.iter().filter(|c| c.first().map(String::as_str) == Some("-A")).collect();

    let bypass_attempts =
        install_attempts.iter().filter(|c| c.contains(&"--queue-bypass".to_string())).count();
    let fallback_attempts = install_attempts
        .iter()
        .filter(|c| c.contains(&"NFQUEUE".to_string()) && !c.contains(&"--queue-bypass".to_string()))
        .count();

    assert_eq!(bypass_attempts, 2, "one --queue-bypass attempt per port");
    assert_eq!(fallback_attempts, 2, "one fallback attempt per port after rejection");
}

#[test]
fn install_succeeds_without_fallback_when_queue_bypass_is_accepted() {
    let calls: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let calls_for_closure = calls.clone();
    let mut fw = IptablesFirewall::with_runner(Box::new(move |args: &[&str]| {
        calls_for_closure.lock().unwrap().push(args.iter().map(|s| s.to_string()).collect());
        Ok(Output { status: ExitStatus::from_raw(0), stdout: Vec::new(), stderr: Vec::new() })
    }));

    fw.install(0, 0x10DEAD, &[80, 443]).expect("install should succeed");

    let calls = calls.lock().unwrap();
    let install_attempts: Vec<&Vec<String>> =
        calls.iter().filter(|c| c.first().map(String::as_str) == Some("-A")).collect();
    assert_eq!(install_attempts.len(), 2, "no fallback retry needed");
}

#[test]
fn remove_is_idempotent_when_rules_are_already_gone() {
    let (_calls, runner) = recorded_runner();
    let mut fw = IptablesFirewall::with_runner(Box::new(runner));

    for _ in 0..3 {
        fw.remove(0, 0x10DEAD, &[80, 443]).expect("remove never fails even if nothing was installed");
    }
}
