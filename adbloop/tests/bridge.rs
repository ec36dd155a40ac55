//! End-to-end runs of the bridge against a fake daemon on loopback.

use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use adbloop::{Bridge, Config, PRIVATE_KEY_FILE};
use adbloop_proto::{
    AUTH, AUTH_SIGNATURE, AUTH_TOKEN, CNXN, MAX_PAYLOAD, Message, OPEN, VERSION,
};

/// How the fake daemon answers a `shell:` command.
type Responder = fn(&str) -> String;

/// Serves `sessions` authenticated sessions, skipping reset connections, and
/// returns every shell command it was asked to run.
fn fake_daemon(
    listener: TcpListener,
    sessions: usize,
    challenge: bool,
    respond: Responder,
) -> JoinHandle<Vec<String>> {
    thread::spawn(move || {
        let mut commands = Vec::new();
        let mut served = 0;
        while served < sessions {
            let (stream, _) = listener.accept().unwrap();
            if serve(stream, challenge, respond, &mut commands) {
                served += 1;
            }
        }
        commands
    })
}

/// Runs one connection. Returns `false` for a reset connection that hung up at once.
fn serve(
    stream: TcpStream,
    challenge: bool,
    respond: Responder,
    commands: &mut Vec<String>,
) -> bool {
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);

    let Ok(hello) = adbloop_proto::decode(&mut reader) else {
        return false;
    };
    assert_eq!(hello.command, CNXN);

    if challenge {
        adbloop_proto::encode(&mut writer, &Message::auth(AUTH_TOKEN, vec![0x5a; 20])).unwrap();
        let signed = adbloop_proto::decode(&mut reader).unwrap();
        assert_eq!((signed.command, signed.arg0), (AUTH, AUTH_SIGNATURE));
        assert_eq!(signed.payload.len(), 256);
    }
    let banner = "device::ro.product.model=fake;\0";
    adbloop_proto::encode(&mut writer, &Message::connect(VERSION, MAX_PAYLOAD, banner)).unwrap();

    let mut next_remote = 100;
    while let Ok(msg) = adbloop_proto::decode(&mut reader) {
        if msg.command != OPEN {
            continue;
        }
        let destination = String::from_utf8_lossy(&msg.payload);
        let command = destination
            .trim_end_matches('\0')
            .trim_start_matches("shell:")
            .to_owned();
        let (local, remote) = (msg.arg0, next_remote);
        next_remote += 1;

        let output = respond(&command);
        commands.push(command);
        adbloop_proto::encode(&mut writer, &Message::okay(remote, local)).unwrap();
        if !output.is_empty() {
            adbloop_proto::encode(&mut writer, &Message::write(remote, local, output)).unwrap();
        }
        adbloop_proto::encode(&mut writer, &Message::close(remote, local)).unwrap();
    }
    true
}

fn config(port: u16, key_dir: &std::path::Path) -> Config {
    Config::default()
        .with_port(port)
        .with_hosts(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])
        .with_reset_pause(Duration::from_millis(20))
        .with_key_dir(key_dir)
        .with_package("com.example.cam")
}

fn bind() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

#[test]
fn grant_runs_every_step_and_counts_failures() {
    let (listener, port) = bind();
    let daemon = fake_daemon(listener, 1, false, |cmd| {
        if cmd.ends_with("READ_LOGS") {
            "Security exception: not allowed to grant READ_LOGS".into()
        } else {
            String::new()
        }
    });
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(port, dir.path());
    let expected = cfg.permissions.len() + cfg.app_ops.len() + 1;
    let bridge = Bridge::new(cfg).unwrap();

    let mut logs = Vec::new();
    let ok = bridge.grant_all_permissions().wait(|l| logs.push(l.to_owned()));
    drop(bridge);
    let commands = daemon.join().unwrap();

    assert!(!ok);
    assert_eq!(commands.len(), expected);
    assert_eq!(commands[0], "pm grant com.example.cam android.permission.CAMERA");
    assert_eq!(commands.last().unwrap(), "dumpsys deviceidle whitelist +com.example.cam");
    assert_eq!(
        logs.last().unwrap(),
        &format!("Done: {} succeeded, 1 failed.", expected - 1)
    );
    assert!(
        !dir.path().join(PRIVATE_KEY_FILE).exists(),
        "no key is needed when the daemon accepts immediately"
    );
}

#[test]
fn signed_session_installs_and_reuses_the_key() {
    let (listener, port) = bind();
    let daemon = fake_daemon(listener, 2, true, |cmd| {
        if cmd.starts_with("pm install") {
            "Performing Streamed Install\nSuccess\n".into()
        } else {
            "ok\n".into()
        }
    });
    let dir = tempfile::tempdir().unwrap();
    let bridge = Bridge::new(config(port, dir.path())).unwrap();

    assert!(bridge.install_apk("/sdcard/Download/cam.apk").wait(|_| {}));
    let first_key = std::fs::read(dir.path().join(PRIVATE_KEY_FILE)).unwrap();

    let mut logs = Vec::new();
    assert!(bridge.execute_script_file("/sdcard/setup.sh").wait(|l| logs.push(l.to_owned())));
    drop(bridge);

    let commands = daemon.join().unwrap();
    assert_eq!(
        commands,
        ["pm install -r -t /sdcard/Download/cam.apk", "sh /sdcard/setup.sh"]
    );
    assert!(logs.contains(&"ok".to_owned()));
    assert_eq!(std::fs::read(dir.path().join(PRIVATE_KEY_FILE)).unwrap(), first_key);
}

#[test]
fn script_error_marker_fails_the_operation() {
    let (listener, port) = bind();
    let daemon = fake_daemon(listener, 1, false, |_| "step 1\n[ERROR] step 2\nstep 3\n".into());
    let dir = tempfile::tempdir().unwrap();
    let bridge = Bridge::new(config(port, dir.path())).unwrap();

    let mut logs = Vec::new();
    let ok = bridge.execute_script_file("/sdcard/setup.sh").wait(|l| logs.push(l.to_owned()));
    drop(bridge);
    daemon.join().unwrap();

    assert!(!ok);
    assert!(logs.contains(&"[ERROR] step 2".to_owned()));
}

#[tokio::test]
async fn events_can_be_awaited() {
    let (listener, port) = bind();
    let daemon = fake_daemon(listener, 1, false, |_| String::new());
    let dir = tempfile::tempdir().unwrap();
    let bridge = Bridge::new(config(port, dir.path())).unwrap();

    let mut op = bridge.execute_script_file("/sdcard/quiet.sh");
    let mut finished = None;
    while let Some(event) = op.next_event().await {
        if let adbloop::Event::Finished { success } = event {
            finished = Some(success);
        }
    }
    drop(bridge);
    daemon.join().unwrap();

    assert_eq!(finished, Some(true));
}
