//! # rtosZero Demo Firmware
//!
//! The classic workload for exercising the kernel:
//!
//! | Task | Priority | Behavior |
//! |------|----------|----------|
//! | `Idle` | 7 | Yields forever; runs when nothing else can |
//! | `LengthyFn` | 6 | Holds the resource mutex through a long loop |
//! | `Flash4Hz` | 4 | Sleeps 125 ms per pass |
//! | `OneShot` | 2 | Waits on `flashReq`, then sleeps a second |
//! | `ReadKeys` | 6 | Turns a released key into a press event |
//! | `Debounce` | 6 | Turns a press back into a release after 100 ms |
//! | `Important` | 0 | Takes the resource mutex; inherits through `LengthyFn` |
//!
//! No LEDs or pushbuttons are driven here; every `ReadKeys` pass counts as
//! one press so the semaphores keep cycling.

#![cfg_attr(target_os = "none", no_std, no_main)]

#[cfg(target_os = "none")]
mod firmware {
    use cortex_m_rt::entry;
    use panic_halt as _;

    use rtoszero::config::KernelConfig;
    use rtoszero::error::KernelError;
    use rtoszero::kernel;
    use rtoszero::task::TaskEntry;

    const RESOURCE: usize = 0;

    const KEY_PRESSED: usize = 0;
    const KEY_RELEASED: usize = 1;
    const FLASH_REQ: usize = 2;

    extern "C" fn idle() -> ! {
        loop {
            kernel::yield_task();
        }
    }

    extern "C" fn lengthy_fn() -> ! {
        loop {
            kernel::lock(RESOURCE);
            for i in 0..5000u32 {
                core::hint::black_box(i);
                kernel::yield_task();
            }
            kernel::unlock(RESOURCE);
        }
    }

    extern "C" fn flash_4hz() -> ! {
        loop {
            kernel::sleep(125);
        }
    }

    extern "C" fn oneshot() -> ! {
        loop {
            kernel::wait(FLASH_REQ);
            kernel::sleep(1000);
        }
    }

    extern "C" fn read_keys() -> ! {
        loop {
            kernel::wait(KEY_RELEASED);
            kernel::yield_task();
            kernel::post(KEY_PRESSED);
            kernel::post(FLASH_REQ);
        }
    }

    extern "C" fn debounce() -> ! {
        loop {
            kernel::wait(KEY_PRESSED);
            for _ in 0..10 {
                kernel::sleep(10);
            }
            kernel::post(KEY_RELEASED);
        }
    }

    extern "C" fn important() -> ! {
        loop {
            kernel::lock(RESOURCE);
            kernel::sleep(1000);
            kernel::unlock(RESOURCE);
        }
    }

    const TASKS: [(TaskEntry, &str, u8, u32); 7] = [
        (idle, "Idle", 7, 512),
        (lengthy_fn, "LengthyFn", 6, 1024),
        (flash_4hz, "Flash4Hz", 4, 1024),
        (oneshot, "OneShot", 2, 1024),
        (read_keys, "ReadKeys", 6, 1024),
        (debounce, "Debounce", 6, 1024),
        (important, "Important", 0, 1024),
    ];

    fn setup() -> Result<(), KernelError> {
        kernel::init(KernelConfig::default());
        kernel::init_mutex(RESOURCE)?;
        kernel::init_semaphore(KEY_PRESSED, 1)?;
        kernel::init_semaphore(KEY_RELEASED, 0)?;
        kernel::init_semaphore(FLASH_REQ, 5)?;
        for (entry, name, priority, stack) in TASKS {
            kernel::create_thread(entry, name, priority, stack)?;
        }
        Ok(())
    }

    #[entry]
    fn main() -> ! {
        match (setup(), cortex_m::Peripherals::take()) {
            (Ok(()), Some(core)) => kernel::start(core),
            (Err(error), _) => log::error!("bring-up failed: {}", error),
            (Ok(()), None) => log::error!("core peripherals already taken"),
        }
        // Nothing was started; stay alive the way idle would.
        loop {
            cortex_m::asm::wfi();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
