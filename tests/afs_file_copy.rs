//! End-to-end AFS scenario: copy a file through the worker-process facade,
//! driven entirely by `poll`. Mirrors the file-copy scenario in
//! `SPEC_FULL.md` §8.4.

#![cfg(feature = "afs")]

use nbio::afs::{Afs, AfsEventKind};

fn drive(afs: &mut Afs, want_at_least: usize, max_rounds: usize) -> Vec<nbio::afs::AfsEvent> {
    let mut collected = Vec::new();
    let mut buf = [libc::pollfd {
        fd: 0,
        events: 0,
        revents: 0,
    }; 32];
    let mut rounds = 0;
    while collected.len() < want_at_least && rounds < max_rounds {
        let n = afs.pollfds(&mut buf);
        let r = unsafe { libc::poll(buf.as_mut_ptr(), n as libc::nfds_t, 2000) };
        assert!(r >= 0, "poll failed");
        afs.update(&buf[..n]);
        collected.extend_from_slice(afs.events());
        rounds += 1;
    }
    collected
}

#[test]
fn copies_a_file_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let src_path = dir.path().join("src.txt");
    let dst_path = dir.path().join("dst.txt");
    std::fs::write(&src_path, b"the quick brown fox").unwrap();

    let mut afs = Afs::new();

    let src = afs.open(src_path.to_str().unwrap(), libc::O_RDONLY).unwrap();
    let dst = afs
        .open(dst_path.to_str().unwrap(), libc::O_RDWR | libc::O_CREAT)
        .unwrap();

    let evs = drive(&mut afs, 2, 20);
    assert!(evs.iter().any(|e| e.kind() == AfsEventKind::Open && e.fd() == Some(src)));
    assert!(evs.iter().any(|e| e.kind() == AfsEventKind::Open && e.fd() == Some(dst)));

    loop {
        afs.readall(src).unwrap();
        let evs = drive(&mut afs, 1, 20);
        let readall_ev = evs
            .iter()
            .find(|e| e.kind() == AfsEventKind::Readall)
            .expect("expected a readall event");
        let n = readall_ev.readall_len();
        if n == 0 {
            break;
        }

        let buf: Vec<u8> = afs.rw_buf(src).unwrap()[..n].to_vec();
        afs.rw_buf_mut(dst).unwrap()[..n].copy_from_slice(&buf);
        afs.write(dst, n).unwrap();
        let evs = drive(&mut afs, 1, 20);
        assert!(evs.iter().any(|e| e.kind() == AfsEventKind::Write));
    }

    afs.fsync(dst).unwrap();
    drive(&mut afs, 1, 20);

    afs.close(src).unwrap();
    afs.close(dst).unwrap();
    drive(&mut afs, 2, 20);

    afs.stop_prep().unwrap();
    drive(&mut afs, 1, 20);
    afs.stop().unwrap();

    let copied = std::fs::read(&dst_path).unwrap();
    assert_eq!(copied, b"the quick brown fox");
}
