//! palisade-probe: walk the allocator API end to end.
//!
//! Run with `MESSAGE_LEVEL=3` to watch the arena traffic. `--fork`
//! additionally demonstrates the fork hooks (and, in propagate builds, the
//! cross-process mirroring of guard flips).

use std::io::Write as _;

fn main() {
    palisade_alloc::init();
    println!("guard back-end..............: {}", palisade_alloc::guard_status());
    println!("arena size..................: {} KB", palisade_alloc::arena_size() / 1024);

    // The classic walk: allocate, write, resize, release.
    let a = palisade_alloc::malloc(100);
    let b = palisade_alloc::calloc(32, 8);
    println!("a...........................: 0x{:012x}", a as usize);
    println!("b...........................: 0x{:012x}", b as usize);
    assert!(!a.is_null() && !b.is_null());

    unsafe {
        for i in 0..100 {
            *a.add(i) = i as u8;
        }
    }
    let a = palisade_alloc::realloc(a, 4000);
    println!("a after realloc.............: 0x{:012x}", a as usize);
    unsafe {
        assert_eq!(*a.add(99), 99);
    }

    println!("arenas......................: {}", palisade_alloc::arena_count());
    print!("{}", palisade_alloc::report());
    let _ = std::io::stdout().flush();

    if std::env::args().any(|arg| arg == "--fork") {
        fork_demo();
    }

    palisade_alloc::free(a);
    palisade_alloc::free(b);
    println!("arenas after release........: {}", palisade_alloc::arena_count());

    palisade_alloc::shutdown();
    println!("done");
}

/// Fork, let the child attach, allocate and release there, and reap it.
fn fork_demo() {
    println!("forking.....................");
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        eprintln!("[probe] fork failed: {}", std::io::Error::last_os_error());
        return;
    }

    if pid == 0 {
        // Child: attach before the first allocation, detach before exit.
        palisade_alloc::start_child_guard();
        let c = palisade_alloc::malloc(20);
        println!("child c.....................: 0x{:012x}", c as usize);
        palisade_alloc::free(c);
        palisade_alloc::stop_child_guard();
        unsafe { libc::_exit(0) };
    }

    let mut status = 0;
    let _ = unsafe { libc::waitpid(pid, &mut status, 0) };
    println!("child {} finished (status {})", pid, status);
}
