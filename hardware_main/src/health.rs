use embassy_time::Instant;

use business_logic::monitor::DeviceHealth;

pub const SYSCLK_HZ: u32 = 48_000_000; // PLL1_R, see the clock setup in main.

/// Bytes between the end of static data and the current stack pointer.
fn stack_headroom() -> u32 {
    let data_end = cortex_m_rt::heap_start() as u32; // End of .bss/.data.
    let sp = cortex_m::register::msp::read();
    sp.saturating_sub(data_end)
}

pub fn device_health() -> DeviceHealth {
    DeviceHealth {
        free_memory_bytes: stack_headroom(),
        cpu_frequency_hz: SYSCLK_HZ,
        uptime_seconds: u32::try_from(Instant::now().as_secs()).unwrap_or(u32::MAX),
    }
}
