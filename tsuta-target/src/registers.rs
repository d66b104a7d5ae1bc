//! レジスタバンク機能

/// リターンアドレスを保持するDWARFレジスタ番号（x86-64ではRIP）
pub const DWARF_REG_RA: u16 = 16;
/// スタックポインタのDWARFレジスタ番号
pub const DWARF_REG_SP: u16 = 7;
/// フレームポインタのDWARFレジスタ番号
pub const DWARF_REG_BP: u16 = 6;

/// 1タスク分の汎用レジスタバンク
///
/// ptraceのGETREGSまたはコアダンプのNT_PRSTATUSから取り込み、
/// DWARFレジスタ番号（x86-64 psABI）でアクセスします。
#[derive(Debug, Clone, Copy)]
pub struct RegisterBank {
    regs: nix::libc::user_regs_struct,
}

impl RegisterBank {
    /// ptrace/コアのレジスタ構造体から作成する
    pub fn from_regs(regs: nix::libc::user_regs_struct) -> Self {
        Self { regs }
    }

    /// すべて0のレジスタバンクを作成する
    pub fn zeroed() -> Self {
        // user_regs_structはCの平坦な構造体なのでゼロ初期化できる
        Self {
            regs: unsafe { std::mem::zeroed() },
        }
    }

    /// プログラムカウンタ（RIP）を取得する
    pub fn pc(&self) -> u64 {
        self.regs.rip
    }

    /// プログラムカウンタ（RIP）を設定する
    pub fn set_pc(&mut self, pc: u64) {
        self.regs.rip = pc;
    }

    /// スタックポインタ（RSP）を取得する
    pub fn sp(&self) -> u64 {
        self.regs.rsp
    }

    /// フレームポインタ（RBP）を取得する
    pub fn bp(&self) -> u64 {
        self.regs.rbp
    }

    /// DWARFレジスタ番号で値を取得する
    pub fn get_dwarf(&self, reg: u16) -> Option<u64> {
        let r = &self.regs;
        Some(match reg {
            0 => r.rax,
            1 => r.rdx,
            2 => r.rcx,
            3 => r.rbx,
            4 => r.rsi,
            5 => r.rdi,
            6 => r.rbp,
            7 => r.rsp,
            8 => r.r8,
            9 => r.r9,
            10 => r.r10,
            11 => r.r11,
            12 => r.r12,
            13 => r.r13,
            14 => r.r14,
            15 => r.r15,
            16 => r.rip,
            49 => r.eflags,
            _ => return None,
        })
    }

    /// DWARFレジスタ番号で値を設定する
    pub fn set_dwarf(&mut self, reg: u16, value: u64) {
        let r = &mut self.regs;
        match reg {
            0 => r.rax = value,
            1 => r.rdx = value,
            2 => r.rcx = value,
            3 => r.rbx = value,
            4 => r.rsi = value,
            5 => r.rdi = value,
            6 => r.rbp = value,
            7 => r.rsp = value,
            8 => r.r8 = value,
            9 => r.r9 = value,
            10 => r.r10 = value,
            11 => r.r11 = value,
            12 => r.r12 = value,
            13 => r.r13 = value,
            14 => r.r14 = value,
            15 => r.r15 = value,
            16 => r.rip = value,
            49 => r.eflags = value,
            _ => {}
        }
    }

    /// リターンアドレスからポインタ認証ビットを除去する
    ///
    /// x86-64では恒等変換。PACを持つターゲットを足す場合はここで
    /// マスクを適用する。
    pub fn strip_return_address(&self, addr: u64) -> u64 {
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dwarf_numbering() {
        let mut bank = RegisterBank::zeroed();
        bank.set_dwarf(7, 0x7fff_0000);
        bank.set_dwarf(16, 0x40_1000);
        assert_eq!(bank.sp(), 0x7fff_0000);
        assert_eq!(bank.pc(), 0x40_1000);
        assert_eq!(bank.get_dwarf(7), Some(0x7fff_0000));
        assert_eq!(bank.get_dwarf(16), Some(0x40_1000));
        // 未知のレジスタ番号はNone
        assert_eq!(bank.get_dwarf(200), None);
    }
}
