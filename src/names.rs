//! Derives the platform object names for a pool from its user-chosen
//! name, mirroring `shared.c`'s `am_shm_create`/`am_shm_delete` naming
//! scheme (`"/%s"`, `"/%s_l"`, `"/%s_s"` on POSIX; `"Global\\%s"` and
//! friends on Windows).
//!
//! A pool needs four cooperating platform objects: the region itself,
//! a small out-of-band word holding the current "global size" (used
//! by the remap-on-lock-entry protocol), the process-shared lock, and
//! (Windows only) a pair of semaphores used to resolve the race
//! between two processes that both believe they are the first
//! attacher to a stale backing file.

/// Every platform-visible name derived from a pool's user-chosen name.
#[derive(Clone, Debug)]
pub struct Names {
    pub region: String,
    pub global_size: String,
    pub lock: String,
    pub attach_sem_a: String,
    pub attach_sem_b: String,
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}

#[cfg(unix)]
pub fn derive(name: &str) -> Names {
    let clean = sanitize(name);
    Names {
        region: format!("/{}", clean),
        global_size: format!("/{}_s", clean),
        lock: format!("/{}_l", clean),
        attach_sem_a: format!("/{}_a1", clean),
        attach_sem_b: format!("/{}_a2", clean),
    }
}

#[cfg(windows)]
pub fn derive(name: &str) -> Names {
    let clean = sanitize(name);
    Names {
        region: format!("Global\\{}", clean),
        global_size: format!("Global\\{}_s", clean),
        lock: format!("Global\\{}_l", clean),
        attach_sem_a: format!("Global\\{}_a1", clean),
        attach_sem_b: format!("Global\\{}_a2", clean),
    }
}
