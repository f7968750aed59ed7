// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! HAL implementation targeting QEMU's `virt` machine.

use core::ptr::{read_volatile, write_volatile};

use super::{Console, Tlb};

const UART0_BASE: usize = 0x1000_0000;
const UART_TX: usize = 0x0;
const UART_LSR: usize = 0x5;
const LSR_TX_IDLE: u8 = 1 << 5;

/// Memory mapped 16550 UART.
pub struct VirtUart;

impl Console for VirtUart {
    fn write_byte(&self, byte: u8) {
        // SAFETY: the UART registers are identity mapped on the virt machine.
        unsafe {
            while read_volatile((UART0_BASE + UART_LSR) as *const u8) & LSR_TX_IDLE == 0 {}
            write_volatile((UART0_BASE + UART_TX) as *mut u8, byte);
        }
    }
}

/// Sv39 TLB helper issuing `sfence.vma`.
pub struct VirtTlb;

impl Tlb for VirtTlb {
    fn flush_all(&self) {
        // SAFETY: a full fence only invalidates cached translations.
        unsafe { riscv::asm::sfence_vma_all() }
    }
}
